// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]

use std::collections::{BTreeMap, BTreeSet};

use libfuzzer_sys::fuzz_target;
use trust_circle::{AnchorKey, Envelope, PeerId, Trust, Verdict, evaluate};

// Decode arbitrary bytes as a container and evaluate whatever comes out of it.
fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = Envelope::from_bytes(data) else {
        return;
    };

    let anchor = AnchorKey::derive(b"fuzz", b"fuzz").expect("anchor derivation");
    let local_peer = PeerId::from(anchor.public_key());
    let trusted = BTreeMap::new();
    let directory = BTreeMap::new();
    let retired = BTreeSet::new();
    let trust = Trust {
        local_peer: &local_peer,
        local_record: None,
        anchor: Some(anchor.public_key()),
        previous_anchor: None,
        trusted: &trusted,
        directory: &directory,
        retired: &retired,
    };

    // Nothing signed by the fuzzer can carry a valid anchor signature.
    let verdict = match &envelope {
        Envelope::Circle(circle) => evaluate(None, circle, &trust),
        Envelope::Ring(ring) => evaluate(None, ring, &trust),
        Envelope::Retirement(_) => return,
    };
    assert!(!matches!(
        verdict,
        Verdict::Trusted
            | Verdict::NoPeerSignature
            | Verdict::NoPeerLeft
            | Verdict::MissingMe
            | Verdict::NotWorthy
    ));

    let bytes = envelope.to_bytes().expect("envelope encoding");
    assert_eq!(Envelope::from_bytes(&bytes).expect("envelope decoding"), envelope);
});

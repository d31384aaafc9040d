// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use assert_matches::assert_matches;
use mock_instant::thread_local::MockClock;

use crate::cbor::encode_cbor;
use crate::concordance::Concordant;
use crate::config::Config;
use crate::crypto::Rng;
use crate::crypto::x25519;
use crate::error::AccountError;
use crate::identity::{AnchorKey, Credentials, PeerId, PrivateKey};
use crate::peer::{DeviceGestalt, PeerInfo};
use crate::ring::{Ring, RingError, RingName, RingPayload, RingType, ViewMembership};
use crate::sync::WaitError;
use crate::test_utils::{MemoryTransport, Network, RecordingNotifier, TestAccount, setup_logging};
use crate::timestamp::Timestamp;
use crate::transport::{Envelope, retirement_name};
use crate::view::{ViewName, ViewSet, view_set};

use super::{Account, CircleStatus, DepartureReason};

const ALICE: usize = 0;
const BOB: usize = 1;
const CHARLIE: usize = 2;

fn config() -> Config {
    Config::new(view_set(["passwords", "notes"]))
        .with_backup_views(view_set(["passwords"]))
        .with_membership_views(view_set(["notes"]))
}

fn passwords() -> ViewName {
    ViewName::new("passwords")
}

/// Alice offers a circle, Bob applies and gets accepted.
async fn two_members(seed: u8) -> Network {
    setup_logging();
    let mut network = Network::new(config(), [seed; 32]);
    network.add_device("alice", None).await;
    network.add_device("bob", None).await;

    network.devices[ALICE].reset_to_offering().await.unwrap();
    network.settle().await;

    network.devices[BOB].request_to_join().await.unwrap();
    network.settle().await;

    let bob = network.peer_id(BOB);
    network.devices[ALICE].accept_applicant(&bob).await.unwrap();
    network.settle().await;
    network
}

/// Delivers the accepted circle and rings of one device to another.
async fn catch_up(network: &mut Network, from: usize, to: usize) {
    let source = &network.devices[from];
    let mut envelopes: Vec<Envelope> = source.circle().into_iter().map(Envelope::Circle).collect();
    envelopes.extend(source.rings.values().cloned().map(Envelope::Ring));
    for envelope in envelopes {
        network.devices[to]
            .deliver(&envelope.name(), &envelope.to_bytes().unwrap())
            .await;
    }
}

/// Adds Charlie as a third member.
async fn three_members(seed: u8) -> Network {
    let mut network = two_members(seed).await;
    network.add_device("charlie", None).await;
    catch_up(&mut network, ALICE, CHARLIE).await;

    network.devices[CHARLIE].request_to_join().await.unwrap();
    network.settle().await;

    let charlie = network.peer_id(CHARLIE);
    network.devices[ALICE]
        .accept_applicant(&charlie)
        .await
        .unwrap();
    network.settle().await;
    network
}

fn standalone_account(seed: u8) -> (Credentials, TestAccount) {
    let rng = Rng::from_seed([seed; 32]);
    let credentials = Credentials::new(&rng).unwrap();
    let account = Account::new(
        config(),
        credentials.clone(),
        DeviceGestalt::new("tablet", "ipad").with_serial_number("SERIAL-1"),
        rng,
        MemoryTransport::default(),
        RecordingNotifier::default(),
    )
    .unwrap();
    (credentials, account)
}

#[tokio::test]
async fn admission_converges() {
    let network = two_members(1).await;
    let alice = &network.devices[ALICE];
    let bob = &network.devices[BOB];

    let circle = alice.circle().unwrap();
    assert_eq!(circle.generation().value(), 3);
    assert_eq!(circle, bob.circle().unwrap());
    assert!(circle.signatures().has_member(alice.peer_id()));
    assert!(circle.signatures().has_member(bob.peer_id()));

    assert_eq!(alice.status(), CircleStatus::InCircle);
    assert_eq!(bob.status(), CircleStatus::InCircle);
    assert_eq!(bob.departure_reason(), DepartureReason::InCircle);
    assert_eq!(alice.peers().len(), 2);
    assert!(alice.applicants().is_empty());

    // Both ended up with the same view membership ring.
    let name = RingName::membership(&ViewName::new("notes"));
    let ring = alice.ring(&name).unwrap();
    assert_eq!(ring.member_ids().len(), 2);
    assert_eq!(Some(ring), bob.ring(&name));
}

#[tokio::test]
async fn stale_proposal_is_answered_with_current_state() {
    let mut network = two_members(2).await;
    let accepted = network.devices[ALICE].circle().unwrap();
    let stale = network.devices[ALICE].previous_circle().unwrap();
    assert_eq!(stale.generation().value(), 2);

    let envelope = Envelope::Circle(stale);
    let result = network.devices[ALICE]
        .process(&envelope.name(), &envelope.to_bytes().unwrap())
        .await;
    assert_matches!(result, Err(AccountError::StaleProposal));

    // Current generation was published again and nothing changed locally.
    let published = network.devices[ALICE].transport().drain();
    assert_eq!(published.len(), 1);
    assert_matches!(
        Envelope::from_bytes(&published[0].1).unwrap(),
        Envelope::Circle(circle) if circle.generation().value() == 3
    );
    assert_eq!(network.devices[ALICE].circle(), Some(accepted));
}

#[tokio::test]
async fn forged_countersignature_is_reverted() {
    let mut network = two_members(3).await;
    let bob = network.peer_id(BOB);
    let accepted = network.devices[ALICE].circle().unwrap();

    let mut forged = accepted.clone();
    let garbage = PrivateKey::from_rng(&Rng::from_seed([99; 32]))
        .unwrap()
        .sign(b"garbage");
    forged.signatures_mut().replace_member(bob, garbage);

    let envelope = Envelope::Circle(forged);
    let result = network.devices[ALICE]
        .process(&envelope.name(), &envelope.to_bytes().unwrap())
        .await;
    assert_matches!(result, Err(AccountError::SignatureInvalid));

    let published = network.devices[ALICE].transport().drain();
    assert_eq!(published.len(), 1);
    assert_eq!(
        Envelope::from_bytes(&published[0].1).unwrap(),
        Envelope::Circle(accepted.clone())
    );
    assert_eq!(network.devices[ALICE].circle(), Some(accepted));
}

#[tokio::test]
async fn backup_ring_covers_backup_keys() {
    let mut network = two_members(4).await;
    let name = RingName::backup(&passwords());
    assert!(network.devices[ALICE].ring(&name).is_none());

    let backup_key = x25519::SecretKey::from_rng(&Rng::from_seed([4; 32]))
        .unwrap()
        .public_key();
    network.devices[ALICE]
        .set_backup_public_key(Some(backup_key))
        .await
        .unwrap();
    network.settle().await;
    network.devices[ALICE].refresh().await.unwrap();
    network.settle().await;

    let alice = &network.devices[ALICE];
    let ring = alice.ring(&name).unwrap();
    let bag = ring.key_bag().unwrap();
    assert!(bag.wrapped().contains_key(alice.peer_id()));
    assert_eq!(ring.member_ids().len(), 1);

    let eligible = alice.eligible_backup_peers(&passwords());
    assert!(!ring.needs_fix(&eligible, None));
    assert_eq!(network.devices[BOB].ring(&name), Some(ring.clone()));
    assert_eq!(alice.backup_peers(&passwords()).len(), 1);

    // Bob announces his key, the ring grows and the old ring needs fixing.
    let bob_key = network.devices[BOB].credentials.backup_public_key();
    network.devices[BOB]
        .set_backup_public_key(Some(bob_key))
        .await
        .unwrap();
    network.settle().await;

    let eligible = network.devices[BOB].eligible_backup_peers(&passwords());
    assert!(ring.needs_fix(&eligible, None));
    let grown = network.devices[BOB].ring(&name).unwrap();
    assert!(grown.generation() > ring.generation());
    assert!(!grown.needs_fix(&eligible, None));
    assert_eq!(network.devices[ALICE].ring(&name), Some(grown.clone()));

    let secret = network.devices[BOB].backup_secret(&passwords()).unwrap();
    assert_eq!(&secret.id(), grown.key_bag().unwrap().secret_id());
}

#[tokio::test]
async fn backup_names_only_hold_backup_rings() {
    let mut network = two_members(14).await;
    let name = RingName::backup(&passwords());
    let member_ids = [network.peer_id(ALICE), network.peer_id(BOB)].into();
    let stranger = PrivateKey::from_rng(&Rng::from_seed([14; 32])).unwrap();

    // Anchor-signed view membership ring squatting on the backup name.
    let mut squatter = Ring::new(
        name.clone(),
        RingType::Base,
        member_ids,
        RingPayload::ViewMembership(ViewMembership::new(view_set(["passwords"]))),
    )
    .unwrap();
    squatter
        .generation_sign(
            network.anchor.private_key(),
            &PeerId::from(&stranger.public_key()),
            &stranger,
        )
        .unwrap();
    let envelope = Envelope::Ring(squatter.clone());
    assert_matches!(
        network.devices[BOB]
            .process(&envelope.name(), &envelope.to_bytes().unwrap())
            .await,
        Err(AccountError::MalformedContainer(_))
    );
    assert!(network.devices[BOB].ring(&name).is_none());

    // A squatter which made it into the state anyway is replaced by a real backup ring.
    network.devices[BOB].rings.insert(name.clone(), squatter);
    let bob_key = network.devices[BOB].credentials.backup_public_key();
    network.devices[BOB]
        .set_backup_public_key(Some(bob_key))
        .await
        .unwrap();
    network.settle().await;

    let ring = network.devices[BOB].ring(&name).unwrap();
    assert_eq!(ring.ring_type(), RingType::Backup);
    assert_eq!(network.devices[ALICE].ring(&name), Some(ring.clone()));
    let secret = network.devices[BOB].backup_secret(&passwords()).unwrap();
    assert_eq!(&secret.id(), ring.key_bag().unwrap().secret_id());
}

#[tokio::test]
async fn ring_types_are_fixed() {
    let mut network = two_members(15).await;
    let name = RingName::membership(&ViewName::new("notes"));
    let accepted = network.devices[ALICE].ring(&name).unwrap();
    assert_eq!(accepted.ring_type(), RingType::Base);

    let mut retyped = Ring::new(
        name.clone(),
        RingType::EntropyKeyed,
        accepted.member_ids().clone(),
        accepted.payload().clone(),
    )
    .unwrap();
    let bob = network.peer_id(BOB);
    retyped
        .generation_sign(
            network.anchor.private_key(),
            &bob,
            network.devices[BOB].credentials.private_key(),
        )
        .unwrap();

    let envelope = Envelope::Ring(retyped);
    assert_matches!(
        network.devices[ALICE]
            .process(&envelope.name(), &envelope.to_bytes().unwrap())
            .await,
        Err(AccountError::Ring(RingError::TypeChanged(
            RingType::Base,
            RingType::EntropyKeyed
        )))
    );
    assert_eq!(network.devices[ALICE].ring(&name), Some(accepted));
}

#[tokio::test]
async fn retirement_strips_backup_ring() {
    let mut network = three_members(5).await;
    for index in [ALICE, BOB, CHARLIE] {
        let key = network.devices[index].credentials.backup_public_key();
        network.devices[index]
            .set_backup_public_key(Some(key))
            .await
            .unwrap();
        network.settle().await;
    }

    let name = RingName::backup(&passwords());
    let charlie = network.peer_id(CHARLIE);
    let before = network.devices[ALICE].ring(&name).unwrap();
    assert!(before.member_ids().contains(&charlie));

    // Charlie's ticket reaches Alice without the circle update.
    let ticket = network.devices[CHARLIE]
        .local_peer()
        .retire(
            network.devices[CHARLIE].credentials.private_key(),
            Timestamp::now(),
        )
        .unwrap();
    let envelope = Envelope::Retirement(ticket.clone());
    assert_eq!(envelope.name(), retirement_name(&ticket));
    assert!(
        network.devices[ALICE]
            .process(&envelope.name(), &envelope.to_bytes().unwrap())
            .await
            .unwrap()
    );

    let alice = &network.devices[ALICE];
    assert!(!alice.circle().unwrap().is_member(&charlie));
    let after = alice.ring(&name).unwrap();
    assert!(!after.member_ids().contains(&charlie));
    assert!(after.generation() > before.generation());
    assert_ne!(after.key_bag().unwrap().secret_id(), before.key_bag().unwrap().secret_id());
    assert!(
        alice
            .transport()
            .published_names()
            .contains(&name.to_string())
    );
    assert_eq!(alice.retirees().len(), 1);

    // Seeing the ticket again changes nothing.
    assert!(
        !network.devices[ALICE]
            .process(&envelope.name(), &envelope.to_bytes().unwrap())
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn redelivery_notifies_once() {
    let mut network = Network::new(config(), [6; 32]);
    network.add_device("alice", None).await;
    network.add_device("bob", None).await;
    network.devices[ALICE].reset_to_offering().await.unwrap();

    let published = network.devices[ALICE].transport().drain();
    for _ in 0..3 {
        for (name, bytes) in &published {
            network.devices[BOB].deliver(name, bytes).await;
        }
    }

    let notifier = network.devices[BOB].notifier().clone();
    let changes = notifier.changes();
    assert_eq!(changes.len(), 1);
    assert!(changes[0].added.contains(&network.peer_id(ALICE)));
    assert_eq!(network.devices[BOB].circle(), network.devices[ALICE].circle());
    assert_eq!(network.devices[BOB].status(), CircleStatus::NotInCircle);

    // Every ring Alice published was adopted exactly once.
    let notes = RingName::membership(&ViewName::new("notes"));
    assert_eq!(notifier.ring_updates(), vec![notes.clone()]);
    assert_eq!(
        network.devices[BOB].ring(&notes),
        network.devices[ALICE].ring(&notes)
    );

    notifier.clear();
    for (name, bytes) in &published {
        network.devices[BOB].deliver(name, bytes).await;
    }
    assert!(notifier.changes().is_empty());
    assert!(notifier.ring_updates().is_empty());
}

#[tokio::test]
async fn retired_peers_never_return() {
    let mut network = two_members(7).await;
    let bob = network.peer_id(BOB);
    let bob_record = network.devices[BOB].local_peer().clone();

    network.devices[BOB].leave_circle().await.unwrap();
    network.settle().await;

    let alice = &network.devices[ALICE];
    assert!(!alice.circle().unwrap().contains(&bob));
    assert_eq!(alice.peers().len(), 1);
    assert_eq!(network.devices[BOB].departure_reason(), DepartureReason::Retired);
    assert_matches!(
        network.devices[BOB].request_to_join().await,
        Err(AccountError::Retired(_))
    );

    // Anchor-signed circle listing Bob again is refused.
    let mut forged = network.devices[ALICE].circle().unwrap();
    forged
        .request_admission(network.anchor.public_key(), bob_record)
        .unwrap();
    forged.accept_applicant(&bob).unwrap();
    let stranger = PrivateKey::from_rng(&Rng::from_seed([7; 32])).unwrap();
    forged
        .generation_sign(
            network.anchor.private_key(),
            &PeerId::from(&stranger.public_key()),
            &stranger,
        )
        .unwrap();
    let accepted = network.devices[ALICE].circle();
    let envelope = Envelope::Circle(forged);
    assert_matches!(
        network.devices[ALICE]
            .process(&envelope.name(), &envelope.to_bytes().unwrap())
            .await,
        Err(AccountError::MalformedContainer(_))
    );
    assert_eq!(network.devices[ALICE].circle(), accepted);
}

#[tokio::test]
async fn anchor_alone_admits_without_countersignature() {
    let mut network = two_members(17).await;
    let intruder_key = PrivateKey::from_rng(&Rng::from_seed([17; 32])).unwrap();
    let mut intruder = PeerInfo::new(
        &intruder_key,
        DeviceGestalt::new("laptop", "unknown"),
        view_set(["notes"]),
        view_set(["notes"]),
    )
    .unwrap();
    intruder
        .sign_application(network.anchor.private_key().unwrap())
        .unwrap();
    let intruder_id = intruder.peer_id().clone();

    // Alice and Bob stay members, only the anchor and the newcomer signed.
    let mut proposal = network.devices[ALICE].circle().unwrap();
    proposal
        .request_admission(network.anchor.public_key(), intruder)
        .unwrap();
    proposal.accept_applicant(&intruder_id).unwrap();
    proposal
        .generation_sign(network.anchor.private_key(), &intruder_id, &intruder_key)
        .unwrap();

    let envelope = Envelope::Circle(proposal.clone());
    assert!(
        network.devices[ALICE]
            .process(&envelope.name(), &envelope.to_bytes().unwrap())
            .await
            .unwrap()
    );

    let circle = network.devices[ALICE].circle().unwrap();
    assert!(circle.is_member(&intruder_id));
    assert_eq!(circle, proposal);
    assert!(!circle.signatures().has_member(network.devices[ALICE].peer_id()));
    assert_eq!(network.devices[ALICE].status(), CircleStatus::InCircle);
}

#[tokio::test]
async fn retirements_are_finalized_after_delay() {
    MockClock::set_system_time(Duration::from_secs(1_000));
    let mut network = two_members(8).await;
    network.devices[BOB].leave_circle().await.unwrap();
    network.settle().await;

    let bob = network.peer_id(BOB);
    assert!(!network.devices[ALICE].retirees[&bob].is_finalized());

    MockClock::advance_system_time(Duration::from_secs(60 * 60));
    network.devices[ALICE].refresh().await.unwrap();
    assert!(!network.devices[ALICE].retirees[&bob].is_finalized());

    MockClock::advance_system_time(Duration::from_secs(60 * 60 * 24));
    network.devices[ALICE].refresh().await.unwrap();
    assert!(network.devices[ALICE].retirees[&bob].is_finalized());
}

#[tokio::test]
async fn retirements_of_strangers_are_not_logged() {
    let mut network = two_members(16).await;
    let rng = Rng::from_seed([16; 32]);
    let record = |private_key: &PrivateKey| {
        PeerInfo::new(
            private_key,
            DeviceGestalt::new("phone", "pixel"),
            view_set(["notes"]),
            view_set(["notes"]),
        )
        .unwrap()
    };

    for _ in 0..50 {
        let private_key = PrivateKey::from_rng(&rng).unwrap();
        let ticket = record(&private_key)
            .retire(&private_key, Timestamp::now())
            .unwrap();
        let envelope = Envelope::Retirement(ticket);
        assert!(
            !network.devices[ALICE]
                .process(&envelope.name(), &envelope.to_bytes().unwrap())
                .await
                .unwrap()
        );
    }
    assert!(network.devices[ALICE].retirees().is_empty());
    let circle = network.devices[ALICE].circle();
    assert!(network.devices[ALICE].transport().drain().is_empty());

    // A device which applied with the anchor is remembered, even if its application never
    // reached us.
    let private_key = PrivateKey::from_rng(&rng).unwrap();
    let mut applicant = record(&private_key);
    applicant
        .sign_application(network.anchor.private_key().unwrap())
        .unwrap();
    let ticket = applicant.retire(&private_key, Timestamp::now()).unwrap();
    let envelope = Envelope::Retirement(ticket);
    assert!(
        network.devices[ALICE]
            .process(&envelope.name(), &envelope.to_bytes().unwrap())
            .await
            .unwrap()
    );
    assert_eq!(network.devices[ALICE].retirees().len(), 1);
    assert_eq!(network.devices[ALICE].circle(), circle);
}

#[tokio::test]
async fn generations_only_move_forward() {
    let mut network = two_members(9).await;
    let mut last = network.devices[ALICE].circle().unwrap().generation();

    let bob = network.peer_id(BOB);
    let views = view_set(["notes"]);
    network.devices[BOB]
        .update_views(&ViewSet::new(), &views)
        .await
        .unwrap();
    network.settle().await;
    let current = network.devices[ALICE].circle().unwrap().generation();
    assert!(current > last);
    last = current;
    assert!(
        !network.devices[ALICE].circle().unwrap().members()[&bob]
            .has_view(&ViewName::new("notes"))
    );

    // Membership ring followed the disabled view.
    let ring = network.devices[ALICE]
        .ring(&RingName::membership(&ViewName::new("notes")))
        .unwrap();
    assert!(!ring.member_ids().contains(&bob));

    network.devices[ALICE].remove_peers(&[bob.clone()]).await.unwrap();
    network.settle().await;
    let current = network.devices[ALICE].circle().unwrap().generation();
    assert!(current > last);

    // Bob was removed by Alice and applies again.
    assert_eq!(
        network.devices[BOB].departure_reason(),
        DepartureReason::MembershipRevoked
    );
    assert_eq!(network.devices[BOB].status(), CircleStatus::Applicant);
    assert_eq!(network.devices[ALICE].applicants().len(), 1);
}

#[tokio::test]
async fn rejected_applicant() {
    let mut network = Network::new(config(), [10; 32]);
    network.add_device("alice", None).await;
    network.add_device("bob", None).await;
    network.devices[ALICE].reset_to_offering().await.unwrap();
    network.settle().await;
    network.devices[BOB].request_to_join().await.unwrap();
    network.settle().await;

    let bob = network.peer_id(BOB);
    network.devices[ALICE].reject_applicant(&bob).await.unwrap();
    network.settle().await;
    assert_eq!(
        network.devices[BOB].departure_reason(),
        DepartureReason::Rejected
    );
    assert_matches!(
        network.devices[BOB].accept_applicant(&bob).await,
        Err(AccountError::NotAMember(_))
    );
    assert_matches!(
        network.devices[ALICE].accept_applicant(&bob).await,
        Err(AccountError::NotApplicant(_))
    );

    // A rejected device can apply again.
    network.devices[BOB].request_to_join().await.unwrap();
    network.settle().await;
    assert_eq!(network.devices[ALICE].applicants().len(), 1);

    network.devices[BOB].withdraw_application().await.unwrap();
    network.settle().await;
    assert!(network.devices[ALICE].applicants().is_empty());
    assert_eq!(
        network.devices[BOB].departure_reason(),
        DepartureReason::Withdrew
    );
}

#[tokio::test]
async fn reset_to_empty() {
    let mut network = two_members(11).await;
    network.devices[ALICE].reset_to_empty().await.unwrap();
    network.settle().await;

    for index in [ALICE, BOB] {
        let device = &network.devices[index];
        assert!(device.circle().unwrap().is_empty());
        assert_eq!(device.departure_reason(), DepartureReason::CircleReset);
        assert_eq!(device.status(), CircleStatus::NotInCircle);
    }
}

#[tokio::test]
async fn leaving_an_untrusted_circle() {
    let mut network = two_members(12).await;
    let alice = network.peer_id(ALICE);
    let bob = network.peer_id(BOB);

    // Somebody holding the anchor replaces everyone Bob trusted.
    let rng = Rng::from_seed([12; 32]);
    let intruder_key = PrivateKey::from_rng(&rng).unwrap();
    let mut intruder = crate::peer::PeerInfo::new(
        &intruder_key,
        DeviceGestalt::new("intruder", "unknown"),
        view_set(["notes"]),
        view_set(["notes"]),
    )
    .unwrap();
    intruder
        .sign_application(network.anchor.private_key().unwrap())
        .unwrap();

    let mut takeover = network.devices[BOB].circle().unwrap();
    takeover.remove_peer(&alice);
    takeover
        .request_admission(network.anchor.public_key(), intruder.clone())
        .unwrap();
    takeover.accept_applicant(intruder.peer_id()).unwrap();
    takeover.remove_peer(&bob);
    takeover
        .generation_sign(network.anchor.private_key(), intruder.peer_id(), &intruder_key)
        .unwrap();

    let envelope = Envelope::Circle(takeover);
    assert_matches!(
        network.devices[BOB]
            .process(&envelope.name(), &envelope.to_bytes().unwrap())
            .await,
        Err(AccountError::QuorumLost)
    );
    assert_eq!(
        network.devices[BOB].departure_reason(),
        DepartureReason::LeftUntrustedCircle
    );
    assert_eq!(network.devices[BOB].status(), CircleStatus::NotInCircle);
}

#[tokio::test]
async fn ghosts_are_removed() {
    let mut network = Network::new(config(), [13; 32]);
    network.add_device("alice", None).await;
    network.add_device("phone", Some("SERIAL-9")).await;
    let phone = 1;

    network.devices[ALICE].reset_to_offering().await.unwrap();
    network.settle().await;
    network.devices[phone].request_to_join().await.unwrap();
    network.settle().await;
    let old_id = network.peer_id(phone);
    network.devices[ALICE].accept_applicant(&old_id).await.unwrap();
    network.settle().await;

    // The phone gets reinstalled and enrolls again with new keys.
    network.devices.pop();
    network.add_device("phone", Some("SERIAL-9")).await;
    catch_up(&mut network, ALICE, phone).await;
    network.devices[phone].request_to_join().await.unwrap();
    network.settle().await;
    let new_id = network.peer_id(phone);
    network.devices[ALICE].accept_applicant(&new_id).await.unwrap();
    network.settle().await;
    assert!(network.devices[ALICE].circle().unwrap().is_member(&old_id));

    network.devices[phone].refresh().await.unwrap();
    network.settle().await;

    let circle = network.devices[ALICE].circle().unwrap();
    assert!(!circle.contains(&old_id));
    assert!(circle.is_member(&new_id));
    assert_eq!(network.devices[ALICE].circle(), network.devices[phone].circle());
}

#[tokio::test]
async fn anchor_rotation_resigns() {
    let mut network = two_members(14).await;
    let old_anchor = network.anchor.clone();
    let new_anchor = AnchorKey::derive(b"a new passphrase", b"test-salt").unwrap();
    let generation = network.devices[ALICE].circle().unwrap().generation();

    network.devices[BOB].set_anchor(new_anchor.clone()).await.unwrap();
    network.devices[ALICE]
        .set_anchor(new_anchor.clone())
        .await
        .unwrap();
    network.settle().await;

    for index in [ALICE, BOB] {
        let device = &network.devices[index];
        let circle = device.circle().unwrap();
        assert!(circle.generation() > generation);
        let bytes = circle.signing_bytes().unwrap();
        assert!(
            new_anchor
                .public_key()
                .verify(&bytes, circle.signatures().anchor().unwrap())
                .is_ok()
        );
        assert_eq!(device.anchor().unwrap(), &new_anchor);
    }
    assert_ne!(old_anchor.public_key(), new_anchor.public_key());
}

#[tokio::test]
async fn missing_anchor() {
    let (_, mut account) = standalone_account(15);
    assert_matches!(
        account.reset_to_offering().await,
        Err(AccountError::NoTrustAnchor)
    );
    assert_matches!(account.request_to_join().await, Err(AccountError::NoTrustAnchor));

    let anchor = AnchorKey::derive(b"passphrase", b"salt").unwrap();
    account.set_anchor(anchor.to_public()).await.unwrap();
    assert_matches!(
        account.reset_to_offering().await,
        Err(AccountError::NoTrustAnchor)
    );
}

#[tokio::test]
async fn persistence_across_versions() {
    let (credentials, mut account) = standalone_account(16);
    let anchor = AnchorKey::derive(b"passphrase", b"salt").unwrap();
    account.set_anchor(anchor.clone()).await.unwrap();
    account.reset_to_offering().await.unwrap();
    account.set_gestalt(DeviceGestalt::new("tablet", "ipad pro")).await.unwrap();
    account.set_expansion("sync-cursor", vec![1, 2, 3]);

    let restore = |bytes: &[u8]| {
        Account::deserialize(
            bytes,
            config(),
            credentials.clone(),
            Rng::from_seed([0; 32]),
            MemoryTransport::default(),
            RecordingNotifier::default(),
        )
    };

    let restored = restore(account.serialize().unwrap().as_slice()).unwrap();
    assert_eq!(restored.circle(), account.circle());
    assert_eq!(restored.previous_circle(), account.previous_circle());
    assert_eq!(restored.local_peer(), account.local_peer());
    assert_eq!(restored.rings, account.rings);
    assert_eq!(restored.expansion("sync-cursor"), Some(&[1, 2, 3][..]));
    assert_eq!(restored.departure_reason(), DepartureReason::InCircle);
    assert!(restored.anchor().is_none());

    let v7 = restore(account.serialize_as(7).as_slice()).unwrap();
    assert_eq!(v7.circle(), account.circle());
    assert_eq!(v7.rings, account.rings);
    assert!(v7.previous_circle().is_none());
    assert!(v7.expansion("sync-cursor").is_none());

    let v6 = restore(account.serialize_as(6).as_slice()).unwrap();
    assert_eq!(v6.circle(), account.circle());
    assert!(v6.rings.is_empty());
    assert_eq!(v6.departure_reason(), DepartureReason::InCircle);

    assert_matches!(
        restore(encode_cbor(&vec![9u64]).unwrap().as_slice()),
        Err(AccountError::Decode(_))
    );

    // State of another device is refused.
    let (_, other) = standalone_account(17);
    assert_matches!(
        restore(other.serialize().unwrap().as_slice()),
        Err(AccountError::MalformedContainer(_))
    );
}

#[tokio::test]
async fn waiting_for_views() {
    let mut network = two_members(18).await;
    let bob = network.peer_id(BOB);

    let waiter = network.devices[ALICE].wait_for_views(view_set(["passwords"]));
    let handle = tokio::spawn(waiter.wait());
    tokio::task::yield_now().await;
    assert!(!handle.is_finished());

    network.devices[ALICE].peer_synced(bob, view_set(["passwords", "notes"]));
    assert_eq!(handle.await.unwrap(), Ok(()));

    assert_eq!(
        network.devices[ALICE]
            .wait_for_views(view_set(["unknown"]))
            .wait()
            .await,
        Err(WaitError::EmptyViewSet)
    );

    let waiter = network.devices[BOB].wait_for_views(view_set(["passwords"]));
    network.devices[BOB].leave_circle().await.unwrap();
    assert_eq!(waiter.wait().await, Err(WaitError::Departed));
}

#[tokio::test]
async fn recovery_key_reaches_backups() {
    let mut network = two_members(19).await;
    for index in [ALICE, BOB] {
        let key = network.devices[index].credentials.backup_public_key();
        network.devices[index]
            .set_backup_public_key(Some(key))
            .await
            .unwrap();
        network.settle().await;
    }

    let recovery_secret = x25519::SecretKey::from_rng(&Rng::from_seed([19; 32])).unwrap();
    network.devices[ALICE]
        .set_recovery_key(Some(recovery_secret.public_key()))
        .await
        .unwrap();
    network.settle().await;

    for index in [ALICE, BOB] {
        let device = &network.devices[index];
        let handle = device.recovery().unwrap();
        assert_eq!(handle.public_key(), &recovery_secret.public_key());
        assert_eq!(handle.fingerprint(), &recovery_secret.public_key().fingerprint());

        let ring = device.ring(&RingName::backup(&passwords())).unwrap();
        let bag = ring.key_bag().unwrap();
        assert!(bag.has_recovery());
        let secret = bag.open_with_recovery(&recovery_secret).unwrap();
        assert_eq!(&secret.id(), bag.secret_id());
    }

    let recovery = network.devices[BOB].ring(&RingName::recovery()).unwrap();
    assert_eq!(recovery.member_ids().len(), 2);
}

#[tokio::test]
async fn transport_failures_are_reported() {
    let mut network = two_members(20).await;
    network.devices[ALICE].transport().set_offline(true);
    assert_matches!(
        network.devices[ALICE]
            .set_gestalt(DeviceGestalt::new("desktop", "framework"))
            .await,
        Err(AccountError::Transport(_))
    );
    network.devices[ALICE].transport().set_offline(false);
    network.discard();

    // Garbage and misnamed containers are dropped.
    assert_matches!(
        network.devices[BOB].process("circle", &[0xff, 0x00]).await,
        Err(AccountError::MalformedContainer(_))
    );
    let envelope = Envelope::Circle(network.devices[ALICE].circle().unwrap());
    assert_matches!(
        network.devices[BOB]
            .process("elsewhere", &envelope.to_bytes().unwrap())
            .await,
        Err(AccountError::MalformedContainer(_))
    );
}

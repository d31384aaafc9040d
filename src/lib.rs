// SPDX-License-Identifier: MIT OR Apache-2.0

#![cfg_attr(docsrs, feature(doc_cfg))]

//! `trust-circle` manages which devices belong to a group of devices owned by one person, without
//! relying on a central server.
//!
//! Every device holds a replica of the signed membership state, the **circle**. Devices propose
//! changes by publishing a new generation of the circle through a store-and-forward transport,
//! and every receiving device independently decides whether to accept, countersign, revert or
//! ignore it. Proposals need to be signed by the group's **anchor key**, which is derived from a
//! shared passphrase. A proposal signed by the anchor alone is accepted as long as it keeps a
//! member the receiving device already trusted, but the device only countersigns once one of
//! those members signed it as well. Proposals dropping every trusted member make the device
//! leave the circle. Anyone who learned the passphrase can therefore change the membership.
//!
//! Next to the circle, signed **rings** distribute per-view data among a subset of the members:
//! which members sync a view, HPKE-wrapped slices of a backup secret for each member holding a
//! backup key, and an optional recovery key.
//!
//! ## Structure
//!
//! - [`concordance`] decides about incoming proposals, independent of circles or rings.
//! - [`Circle`] and [`Ring`] are the signed states, [`PeerInfo`] the self-signed device records
//!   inside them.
//! - [`Account`] is the lifecycle controller of the local device, handling delivered
//!   containers and local commands. Share it between tasks with an [`AccountHandle`].
//! - Applications plug in a [`Transport`] to publish containers and a [`Notifier`] to learn
//!   about membership changes.
//!
//! ## Example
//!
//! ```ignore
//! let anchor = AnchorKey::derive(b"our group passphrase", b"salt")?;
//! let mut account = Account::new(config, credentials, gestalt, rng, transport, ())?;
//! account.set_anchor(anchor).await?;
//! account.request_to_join().await?;
//!
//! // Containers received from the transport.
//! account.deliver(&name, &bytes).await;
//! ```
pub mod account;
pub mod action;
pub mod cbor;
pub mod circle;
pub mod concordance;
pub mod config;
pub mod crypto;
mod error;
pub mod event;
mod handle;
pub mod identity;
pub mod keybag;
pub mod peer;
pub mod ring;
pub mod signed;
pub mod sync;
#[cfg(any(test, feature = "test_utils"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test_utils")))]
pub mod test_utils;
pub mod timestamp;
pub mod transport;
pub mod view;

pub use account::{Account, CircleStatus, DepartureReason, RecoveryHandle, Retiree};
pub use action::Action;
pub use circle::{Circle, CircleError};
pub use concordance::{Concordant, Trust, Verdict, evaluate};
pub use config::Config;
pub use error::AccountError;
pub use event::{MembershipChange, Notifier};
pub use handle::AccountHandle;
pub use identity::{AnchorKey, Credentials, PeerId, PrivateKey, PublicKey, Signature};
pub use keybag::{BackupSecret, BackupSliceKeyBag, RecoveryKeyBag};
pub use peer::{DeviceGestalt, PeerInfo};
pub use ring::{Ring, RingName, RingPayload, RingType};
pub use signed::{Generation, GenerationOverflow, Signatures};
pub use sync::{SyncProgress, SyncWaiter, WaitError};
pub use timestamp::Timestamp;
pub use transport::{Envelope, Transport, TransportError};
pub use view::{ViewName, ViewSet, view_set};

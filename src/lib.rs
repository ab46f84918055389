//! Asymmetric private set intersection
//!
//! A two-party protocol in which a receiver holding a small set learns
//! which of its items appear in a sender's much larger set — and,
//! optionally, a label stored with each match — while the sender learns
//! nothing about the receiver's items.
//!
//! ## How a query flows
//!
//! ```text
//! receiver items → cuckoo table → (optional) OPRF round-trip
//!   → felts → encrypted sparse powers → sender expands via PowersDag
//!   → per-bundle batched polynomial evaluation → result packages
//!   → receiver decrypts, matches, unmasks labels
//! ```
//!
//! The sender arranges its set into [`bin_bundle::BinBundle`]s: per bin, a
//! monic *matching polynomial* vanishing exactly on the stored key felts
//! (and a Newton *interpolation polynomial* carrying label felts), batched
//! degree-wise into plaintexts so one homomorphic evaluation answers a
//! whole bundle. The receiver only ever sends the sparse power set from
//! [`params::PsiParams`]; the sender rebuilds the full power basis along
//! the deterministic [`powers::PowersDag`].
//!
//! ## Invariants
//!
//! - **Field.** All engine arithmetic is over the prime plain modulus `p`;
//!   encoded felts carry `bitlen(p) − 1` bits so `p − 1` stays reserved as
//!   the empty-bin sentinel. The all-zero item is the reserved empty
//!   sentinel on the receiver side.
//! - **Scheme seam.** Everything cryptographic programs against the
//!   leveled-scheme interface in [`he`]; see that module's docs for what
//!   the shipped reference evaluator does and does not provide.
//! - **Concurrency.** `CryptoContext` is immutable and shared by
//!   reference. The `SenderDb` sits behind a reader-writer lock in the
//!   orchestrator; queries read a quiescent snapshot. Two parallelism
//!   levels only: bundles on the pool, the powers DAG on scoped threads.
//! - **Errors.** Every recoverable failure is a typed `Result`; panics are
//!   reserved for internal invariant violations.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// Prime-field scalar ops and the negacyclic NTT behind batching.
pub mod ffield;

/// Bitstring ↔ felt packing for items and label parts.
pub mod bitstring;

/// Monic-roots and Newton interpolation polynomials.
pub mod interpolate;

/// Items, hashed items, and label keys.
pub mod item;

/// Label AEAD (keyed-XOF stream cipher + MAC).
pub mod label;

/// Blinded-evaluation OPRF on a prime-order group.
pub mod oprf;

/// Deterministic source→target power computation plan.
pub mod powers;

/// Receiver-side cuckoo table.
pub mod cuckoo;

/// Leveled-scheme interface and the transparent reference evaluator.
pub mod he;

/// Shared encoder/evaluator context.
pub mod context;

/// Frozen protocol parameters and their invariants.
pub mod params;

/// Bin bundles: bins, polynomial caches, batched evaluation.
pub mod bin_bundle;

/// The sender's database: placement, mutation, persistence.
pub mod sender_db;

/// Query answering: power expansion and bundle evaluation.
pub mod query;

/// Typed wire messages with version-tagged framing.
pub mod messages;

/// Ordered transports, including client-id routing.
pub mod channel;

/// Receiver: parameter/OPRF requests, query building, result decoding.
pub mod receiver;

/// Sender orchestrator: dispatcher loop and worker pools.
pub mod sender;

// ============================================================================
// Canonical aliases and root-level re-exports
// ============================================================================

/// Field element below the plain modulus.
pub use crate::ffield::Felt;

pub use crate::channel::{Channel, StreamChannel};
pub use crate::context::CryptoContext;
pub use crate::item::{HashedItem, Item, LabelKey};
pub use crate::messages::{QueryRequest, ResultPackage, SenderOperation};
pub use crate::oprf::OprfKey;
pub use crate::params::{ItemParams, PsiParams, QueryParams, TableParams};
pub use crate::receiver::{MatchRecord, Receiver};
pub use crate::sender::{Sender, SenderConfig};
pub use crate::sender_db::SenderDb;

//! Sender orchestrator
//!
//! [`Sender`] owns the shared database handle and the worker pool, and runs
//! the dispatcher loop: receive an operation, answer it, repeat. Parameter
//! and OPRF requests are answered under a reader lock; queries take a
//! reader-locked snapshot after making sure every bundle cache is current
//! (cache regeneration is the only write the dispatcher ever performs).
//!
//! The stop flag is observed between receives; an in-flight request runs to
//! completion. A closed channel ends the loop cleanly. A request that fails
//! is logged and dropped — the dispatcher keeps serving (the peer's
//! blocked receive resolves when it closes the channel).
//!
//! Concurrency discipline: query evaluation fans out across bundle indices
//! on the orchestrator's rayon pool; each bundle's powers-DAG walk uses its
//! own scoped threads and never enqueues into the pool.

#![forbid(unsafe_code)]

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info};

use crate::channel::{Channel, RoutedStreamChannel};
use crate::messages::{
    OprfRequest, OprfResponse, ParmsResponse, ProtocolError, QueryRequest, QueryResponse,
    Response, ResultPackage, SenderOperation,
};
use crate::oprf::{self, OprfError};
use crate::query::{self, QueryError};
use crate::sender_db::{SenderDb, SenderDbError};

/// Errors surfaced by the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Db(#[from] SenderDbError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Oprf(#[from] OprfError),
    #[error("receiver requested an OPRF evaluation but the database has no key")]
    OprfDisabled,
    #[error("worker pool construction failed: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Worker sizing.
#[derive(Debug, Clone, Copy)]
pub struct SenderConfig {
    /// Rayon pool width; 0 means the library default (one per core).
    pub worker_threads: usize,
    /// Scoped threads per powers-DAG walk.
    pub inner_workers: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self { worker_threads: 0, inner_workers: 4 }
    }
}

/// One outbound frame of a dispatched request.
enum OutFrame {
    Response(Response),
    Package(ResultPackage),
}

/// The sender-side service: shared database plus worker pool.
pub struct Sender {
    db: Arc<RwLock<SenderDb>>,
    pool: rayon::ThreadPool,
    inner_workers: usize,
}

impl Sender {
    pub fn new(db: Arc<RwLock<SenderDb>>, config: SenderConfig) -> Result<Self, SenderError> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if config.worker_threads > 0 {
            builder = builder.num_threads(config.worker_threads);
        }
        Ok(Self { db, pool: builder.build()?, inner_workers: config.inner_workers.max(1) })
    }

    /// The shared database handle (writers use this to insert/remove).
    pub fn db(&self) -> Arc<RwLock<SenderDb>> {
        self.db.clone()
    }

    /// Regenerate outstanding bundle caches under the writer lock, on the
    /// orchestrator's pool.
    pub fn regen_caches(&self) -> Result<(), SenderDbError> {
        let mut db = self.db.write();
        self.pool.install(|| db.regen_caches())
    }

    fn ensure_caches(&self) -> Result<(), SenderDbError> {
        let needs_regen = {
            let db = self.db.read();
            (0..db.params().bundle_count())
                .any(|idx| db.bundle_chain(idx).iter().any(|b| !b.cache_valid()))
        };
        if needs_regen {
            self.regen_caches()?;
        }
        Ok(())
    }

    /// Answer one query against a quiescent snapshot.
    pub fn run_query(
        &self,
        request: &QueryRequest,
    ) -> Result<(QueryResponse, Vec<ResultPackage>), SenderError> {
        self.ensure_caches()?;
        let db = self.db.read();
        let inner_workers = self.inner_workers;
        let answered = self.pool.install(|| query::process_query(&db, request, inner_workers))?;
        Ok(answered)
    }

    fn handle_oprf(&self, request: &OprfRequest) -> Result<OprfResponse, SenderError> {
        let db = self.db.read();
        let key = db.oprf_key().ok_or(SenderError::OprfDisabled)?;
        Ok(OprfResponse { data: oprf::evaluate_blob(key, &request.data)? })
    }

    fn dispatch(
        &self,
        op: SenderOperation,
        emit: &mut dyn FnMut(OutFrame) -> Result<(), ProtocolError>,
    ) -> Result<(), SenderError> {
        match op {
            SenderOperation::Parms => {
                let params = self.db.read().params().clone();
                emit(OutFrame::Response(Response::Parms(ParmsResponse { params })))?;
            }
            SenderOperation::Oprf(request) => {
                let response = self.handle_oprf(&request)?;
                emit(OutFrame::Response(Response::Oprf(response)))?;
            }
            SenderOperation::Query(request) => {
                let (response, packages) = self.run_query(&request)?;
                // The top-level response strictly precedes every package.
                emit(OutFrame::Response(Response::Query(response)))?;
                for package in packages {
                    emit(OutFrame::Package(package))?;
                }
            }
        }
        Ok(())
    }

    /// Dispatcher loop over a single-client channel. Returns when the stop
    /// flag is observed or the peer closes the channel.
    pub fn serve(
        &self,
        channel: &mut impl Channel,
        stop: &AtomicBool,
    ) -> Result<(), SenderError> {
        info!("dispatcher started");
        loop {
            if stop.load(Ordering::Relaxed) {
                info!("stop flag observed; dispatcher exiting");
                return Ok(());
            }
            let op = match channel.receive_operation() {
                Ok(op) => op,
                Err(ProtocolError::ChannelClosed) => {
                    info!("channel closed; dispatcher exiting");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            let outcome = self.dispatch(op, &mut |frame| match frame {
                OutFrame::Response(response) => channel.send_response(&response),
                OutFrame::Package(package) => channel.send_result_package(&package),
            });
            if let Err(err) = outcome {
                error!(%err, "request failed; dispatcher continues");
            }
        }
    }

    /// Dispatcher loop over a client-id-routed stream. Responses and
    /// packages carry the originating client's id; per client, frames leave
    /// in send order.
    pub fn serve_routed<R: Read, W: Write>(
        &self,
        channel: &mut RoutedStreamChannel<R, W>,
        stop: &AtomicBool,
    ) -> Result<(), SenderError> {
        info!("routed dispatcher started");
        loop {
            if stop.load(Ordering::Relaxed) {
                info!("stop flag observed; dispatcher exiting");
                return Ok(());
            }
            let (client_id, op) = match channel.receive_operation_from() {
                Ok(got) => got,
                Err(ProtocolError::ChannelClosed) => {
                    info!("channel closed; dispatcher exiting");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            let outcome = self.dispatch(op, &mut |frame| match frame {
                OutFrame::Response(response) => {
                    channel.send_response_to(&client_id, &response)
                }
                OutFrame::Package(package) => {
                    channel.send_result_package_to(&client_id, &package)
                }
            });
            if let Err(err) = outcome {
                error!(%err, "request failed; dispatcher continues");
            }
        }
    }
}

// ============================================================================
// Tests (end-to-end protocol scenarios)
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::duplex;
    use crate::he::EncryptionParameters;
    use crate::item::Item;
    use crate::oprf::OprfKey;
    use crate::params::{ItemParams, PsiParams, QueryParams, TableParams};
    use crate::receiver::{MatchRecord, Receiver};
    use rand::SeedableRng;

    fn tiny_params() -> PsiParams {
        PsiParams::new(
            ItemParams { felts_per_item: 8 },
            TableParams {
                table_size: 512,
                max_items_per_bin: 16,
                hash_func_count: 3,
                hash_func_seed: 0xFEED,
            },
            QueryParams { powers_set: [1, 3, 5].into_iter().collect() },
            EncryptionParameters::new(4096, 65537, vec![50, 40, 40]).unwrap(),
        )
        .unwrap()
    }

    type TestChannel =
        crate::channel::StreamChannel<crate::channel::PipeReader, crate::channel::PipeWriter>;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Run `client` against a serving dispatcher over an in-memory duplex.
    fn with_sender<T: Send>(
        db: SenderDb,
        client: impl FnOnce(&mut TestChannel) -> T + Send,
    ) -> T {
        init_tracing();
        let sender = Sender::new(
            Arc::new(RwLock::new(db)),
            SenderConfig { worker_threads: 2, inner_workers: 2 },
        )
        .unwrap();
        let stop = AtomicBool::new(false);
        let (mut client_side, mut server_side) = duplex();

        std::thread::scope(|scope| {
            let server = scope.spawn(|| sender.serve(&mut server_side, &stop).unwrap());
            let out = client(&mut client_side);
            drop(client_side); // closes the channel; the dispatcher exits
            server.join().unwrap();
            out
        })
    }

    fn found_vector(records: &[MatchRecord]) -> Vec<bool> {
        records.iter().map(|r| r.found).collect()
    }

    #[test]
    fn tiny_unlabeled_end_to_end() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(100);
        let mut db =
            SenderDb::new(tiny_params(), 0, 0, Some(OprfKey::random(&mut rng))).unwrap();
        db.insert(&(1u128..=10).map(Item::from).collect::<Vec<_>>()).unwrap();

        let records = with_sender(db, |channel| {
            let mut rng = rand::rngs::StdRng::seed_from_u64(200);
            let params = Receiver::request_params(channel).unwrap();
            let receiver = Receiver::new(params, &mut rng).unwrap();
            let queried: Vec<Item> =
                (1u128..=5).chain(100..=104).map(Item::from).collect();
            receiver.query(&queried, channel, &mut rng).unwrap()
        });

        assert_eq!(
            found_vector(&records),
            [true, true, true, true, true, false, false, false, false, false]
        );
        assert!(records.iter().all(|r| r.label.is_none()));
    }

    #[test]
    fn tiny_labeled_end_to_end() {
        // label(i) = (~i, i) as two little-endian 64-bit words.
        let label_of = |i: u64| -> Vec<u8> {
            let mut out = Vec::with_capacity(16);
            out.extend_from_slice(&(!i).to_le_bytes());
            out.extend_from_slice(&i.to_le_bytes());
            out
        };

        let mut rng = rand::rngs::StdRng::seed_from_u64(300);
        let mut db =
            SenderDb::new(tiny_params(), 16, 16, Some(OprfKey::random(&mut rng))).unwrap();
        let labeled: Vec<(Item, Vec<u8>)> =
            (1u64..=10).map(|i| (Item::from(i as u128), label_of(i))).collect();
        db.insert_labeled(&labeled).unwrap();

        let records = with_sender(db, |channel| {
            let mut rng = rand::rngs::StdRng::seed_from_u64(400);
            let params = Receiver::request_params(channel).unwrap();
            let receiver = Receiver::new(params, &mut rng).unwrap();
            let queried: Vec<Item> = [3u128, 7, 11].map(Item::from).to_vec();
            receiver.query(&queried, channel, &mut rng).unwrap()
        });

        assert_eq!(found_vector(&records), [true, true, false]);
        assert_eq!(records[0].label.as_deref(), Some(label_of(3).as_slice()));
        assert_eq!(records[1].label.as_deref(), Some(label_of(7).as_slice()));
        assert_eq!(records[2].label, None);
    }

    #[test]
    fn exact_repeats_still_answer_queries() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(500);
        let mut db =
            SenderDb::new(tiny_params(), 0, 0, Some(OprfKey::random(&mut rng))).unwrap();
        let five = Item::from(5u128);
        assert!(matches!(
            db.insert(&[five, five, five]),
            Err(SenderDbError::PartialBatch { failed: 2, .. })
        ));

        let records = with_sender(db, |channel| {
            let mut rng = rand::rngs::StdRng::seed_from_u64(600);
            let params = Receiver::request_params(channel).unwrap();
            let receiver = Receiver::new(params, &mut rng).unwrap();
            receiver.query(&[Item::from(5u128)], channel, &mut rng).unwrap()
        });
        assert_eq!(found_vector(&records), [true]);
    }

    #[test]
    fn stripped_database_still_answers_plain_queries() {
        let mut db = SenderDb::new(tiny_params(), 0, 0, None).unwrap();
        db.insert(&(1u128..=6).map(Item::from).collect::<Vec<_>>()).unwrap();
        db.regen_caches().unwrap();
        db.strip();

        let records = with_sender(db, |channel| {
            let mut rng = rand::rngs::StdRng::seed_from_u64(700);
            let params = Receiver::request_params(channel).unwrap();
            let receiver = Receiver::new(params, &mut rng).unwrap();
            receiver
                .query_plain(&[Item::from(2u128), Item::from(9u128)], channel, &mut rng)
                .unwrap()
        });
        assert_eq!(found_vector(&records), [true, false]);
    }

    #[test]
    fn stop_flag_ends_the_dispatcher_between_requests() {
        let db = SenderDb::new(tiny_params(), 0, 0, None).unwrap();
        let sender =
            Sender::new(Arc::new(RwLock::new(db)), SenderConfig::default()).unwrap();
        let stop = AtomicBool::new(true);
        let (_client_side, mut server_side) = duplex();
        sender.serve(&mut server_side, &stop).unwrap();
    }

    #[test]
    fn mutation_between_queries_is_observed() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(800);
        let db = SenderDb::new(tiny_params(), 0, 0, Some(OprfKey::random(&mut rng))).unwrap();
        let sender = Sender::new(
            Arc::new(RwLock::new(db)),
            SenderConfig { worker_threads: 2, inner_workers: 2 },
        )
        .unwrap();
        let handle = sender.db();
        handle.write().insert(&[Item::from(1u128)]).unwrap();

        let stop = AtomicBool::new(false);
        let (mut client_side, mut server_side) = duplex();
        std::thread::scope(|scope| {
            let server = scope.spawn(|| sender.serve(&mut server_side, &stop).unwrap());

            let mut rng = rand::rngs::StdRng::seed_from_u64(900);
            let params = Receiver::request_params(&mut client_side).unwrap();
            let receiver = Receiver::new(params, &mut rng).unwrap();
            let queried = [Item::from(1u128), Item::from(2u128)];

            let first = receiver.query(&queried, &mut client_side, &mut rng).unwrap();
            assert_eq!(found_vector(&first), [true, false]);

            handle.write().insert(&[Item::from(2u128)]).unwrap();
            let second = receiver.query(&queried, &mut client_side, &mut rng).unwrap();
            assert_eq!(found_vector(&second), [true, true]);

            drop(client_side);
            server.join().unwrap();
        });
    }
}

//! The server-side coordination engine: one [`Server`] object bundles the
//! whole per-process state (layout, transport, data store, queues, sync
//! state) and runs the single-threaded event loop.

mod handlers;
mod requestqueue;
mod steal;
mod sync;
mod workqueue;

pub use requestqueue::RequestQueue;
pub use sync::{IncomingDecision, SyncOutcome, SyncState};
pub use workqueue::WorkQueue;

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;

use tokio::time::{self, Duration, Instant};

use crate::data::DataStore;
use crate::layout::{Layout, Rank};
use crate::msg::WorkUnit;
use crate::server::handlers::RemoteOp;
use crate::transport::{CommHub, Inbox};
use crate::utils::TaskmillError;

/// Work type of closure/insertion notifications, delivered as small
/// control tasks targeted at the listener rank.
pub const CONTROL_TYPE: i32 = 1;

/// Priority of notification control tasks.
pub const CONTROL_PRIORITY: i32 = 1;

/// Configuration parameters struct.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServerConfig {
    /// Number of application work types. Types are `0..work_types`; type 1
    /// is reserved for control notifications.
    pub work_types: i32,

    /// Minimum interval between steal attempts in millisecs.
    pub steal_min_interval_ms: u64,

    /// Cumulative payload byte budget per steal.
    pub steal_max_memory: i64,

    /// Event-loop idle tick used for steal attempts and idle checks, in
    /// millisecs.
    pub idle_tick_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            work_types: 2,
            steal_min_interval_ms: 50,
            steal_max_memory: 16 * 1024 * 1024,
            idle_tick_ms: 100,
        }
    }
}

/// A server rank's entire state, instantiated once per process.
pub struct Server {
    pub(crate) layout: Layout,
    pub(crate) config: ServerConfig,

    pub(crate) hub: CommHub,
    pub(crate) inbox: Inbox,

    pub(crate) store: DataStore,
    pub(crate) workqueue: WorkQueue,
    pub(crate) requestqueue: RequestQueue,
    pub(crate) sync: SyncState,

    /// Putter rank -> work unit whose payload is still in flight to us.
    pub(crate) awaiting_payload: HashMap<Rank, WorkUnit>,

    /// Cross-server deliveries queued by notification routing, performed
    /// through the sync protocol from the main loop.
    pub(crate) remote_ops: VecDeque<RemoteOp>,

    /// My workers that announced they are done requesting work.
    pub(crate) workers_done: HashSet<Rank>,

    pub(crate) shutting_down: bool,

    /// First failure code reported to the master server.
    pub(crate) failure_code: Option<i32>,

    pub(crate) last_steal: Option<Instant>,
    pub(crate) idle_attempt: i64,
}

impl Server {
    /// Creates the server, binds its transport endpoint and wires up the
    /// full mesh. `addrs` lists one address per rank, index = rank.
    pub async fn new_and_setup(
        layout: Layout,
        addrs: &[SocketAddr],
        config: ServerConfig,
    ) -> Result<Self, TaskmillError> {
        if !layout.is_server(layout.rank) {
            return logged_err!("rank {} is not a server rank", layout.rank);
        }
        if config.work_types <= CONTROL_TYPE {
            return logged_err!("invalid config.work_types '{}'", config.work_types);
        }
        if addrs.len() != layout.size as usize {
            return logged_err!(
                "address list length {} != cluster size {}",
                addrs.len(),
                layout.size
            );
        }

        let mut hub = CommHub::new_and_setup(layout.rank, addrs[layout.rank as usize]).await?;
        hub.wireup(addrs).await?;

        let store = DataStore::new(layout.servers, layout.server_num());
        let workqueue = WorkQueue::new(config.work_types);

        pf_info!(
            "server {} up ({} servers, {} workers)",
            layout.rank,
            layout.servers,
            layout.workers
        );

        Ok(Server {
            layout,
            config,
            hub,
            inbox: Inbox::new(),
            store,
            workqueue,
            requestqueue: RequestQueue::new(),
            sync: SyncState::new(),
            awaiting_payload: HashMap::new(),
            remote_ops: VecDeque::new(),
            workers_done: HashSet::new(),
            shutting_down: false,
            failure_code: None,
            last_steal: None,
            idle_attempt: 0,
        })
    }

    /// Whether this server currently has nothing to do: no queued or
    /// in-flight work, and every one of its workers is parked or done.
    pub(crate) fn is_idle(&self) -> bool {
        let my_workers = self.layout.workers_of_server(self.layout.rank) as usize;
        self.workqueue.total_queued() == 0
            && self.awaiting_payload.is_empty()
            && self.requestqueue.size() + self.workers_done.len() == my_workers
    }

    /// Main server event loop. Returns the process exit code: zero, or the
    /// first failure code reported during the run (master server only).
    pub async fn run(&mut self) -> Result<i32, TaskmillError> {
        let tick = Duration::from_millis(self.config.idle_tick_ms);

        while !self.shutting_down {
            // serve sync requests deferred during our own acquisitions,
            // then push out queued cross-server deliveries
            self.serve_pending_syncs().await?;
            self.flush_remote_ops().await?;
            if self.shutting_down {
                break;
            }

            match time::timeout(tick, self.inbox.next_any(&mut self.hub)).await {
                Ok(Ok((rank, msg))) => {
                    self.dispatch(rank, msg).await?;
                }
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => {
                    // idle tick: try to pull work for starved requests,
                    // and let the master probe for cluster quiescence
                    self.maybe_steal().await?;
                    if !self.shutting_down
                        && self.layout.rank == self.layout.master_server()
                    {
                        self.master_idle_check().await?;
                    }
                }
            }
        }

        self.finalize();
        Ok(self.failure_code.unwrap_or(0))
    }

    /// End-of-run bookkeeping: leak report and final statistics.
    pub fn finalize(&self) {
        self.store.report_leaks();
        pf_info!(
            "server {} done (resident datums: {})",
            self.layout.rank,
            self.store.resident()
        );
    }
}

#[cfg(test)]
mod matcher_tests {
    use super::*;
    use crate::layout::ANY_RANK;
    use crate::msg::WorkUnit;
    use std::collections::HashMap;

    fn unit(seq: u64, work_type: i32, target: Rank) -> WorkUnit {
        WorkUnit {
            id: 0,
            timestamp: 0,
            work_type,
            putter: 99,
            priority: (seq % 3) as i32,
            answer: seq as Rank,
            target,
            parallelism: 1,
            payload: vec![],
            payload_len: 0,
        }
    }

    /// For a finite interleaving of puts and gets, every accepted put is
    /// matched to exactly one get of compatible type and target.
    #[test]
    fn every_put_matches_exactly_one_get() {
        let ntypes = 3;
        let nworkers = 6;
        let mut wq = WorkQueue::new(ntypes);
        let mut rq = RequestQueue::new();
        // put seq (via answer field) -> the rank it was delivered to
        let mut delivered: HashMap<u64, Rank> = HashMap::new();
        let mut outstanding_gets: Vec<(Rank, i32)> = Vec::new();

        let mut put_seq = 0u64;
        let mut put_specs: Vec<(u64, i32, Rank)> = Vec::new();

        // deterministic but scrambled interleaving
        let mut state = 0x2545_F491u64;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as i64
        };

        for step in 0..400 {
            if next() % 2 == 0 {
                // put
                let work_type = (next().unsigned_abs() % ntypes as u64) as i32;
                let target = if next() % 4 == 0 {
                    (next().unsigned_abs() % nworkers as u64) as Rank
                } else {
                    ANY_RANK
                };
                let seq = put_seq;
                put_seq += 1;
                put_specs.push((seq, work_type, target));

                // matcher: request queue first, else enqueue
                let matched = if target != ANY_RANK {
                    rq.matches_target(target, work_type).then_some(target)
                } else {
                    rq.matches_type(work_type)
                };
                match matched {
                    Some(rank) => {
                        delivered.insert(seq, rank);
                        outstanding_gets.retain(|&(r, _)| r != rank);
                    }
                    None => {
                        wq.add(unit(seq, work_type, target));
                    }
                }
            } else {
                // get from a worker that isn't already waiting
                let rank = (step % nworkers) as Rank;
                if rq.contains(rank) || outstanding_gets.iter().any(|&(r, _)| r == rank) {
                    continue;
                }
                let work_type = (next().unsigned_abs() % ntypes as u64) as i32;
                match wq.get(rank, work_type) {
                    Some(u) => {
                        delivered.insert(u.answer as u64, rank);
                    }
                    None => {
                        rq.add(rank, work_type, 1);
                        outstanding_gets.push((rank, work_type));
                    }
                }
            }
        }

        // drain: keep issuing gets until the queues quiesce
        loop {
            let mut progressed = false;
            for rank in 0..nworkers {
                for work_type in 0..ntypes {
                    if let Some(u) = wq.get(rank, work_type) {
                        delivered.insert(u.answer as u64, rank);
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        assert_eq!(wq.total_queued(), 0);
        // exactly-once: every put delivered to exactly one compatible rank
        assert_eq!(delivered.len(), put_specs.len());
        for (seq, _work_type, target) in put_specs {
            let rank = delivered[&seq];
            assert!(rank >= 0 && rank < nworkers);
            if target != ANY_RANK {
                assert_eq!(rank, target, "targeted put {} went astray", seq);
            }
        }
    }
}

#[cfg(test)]
mod cluster_tests {
    use super::*;
    use crate::codec::value::TypeExtra;
    use crate::codec::{DataType, Value};
    use crate::layout::{ANY_RANK, NULL_RANK};
    use crate::msg::{CreateProps, DataError, RefCounts, RetrieveRc, Status};
    use crate::worker::{GetOutcome, WorkerStub};
    use std::sync::Arc;
    use tokio::sync::Barrier;
    use tokio::task::JoinHandle;

    fn addrs(base: u16, n: i32) -> Vec<SocketAddr> {
        (0..n)
            .map(|i| format!("127.0.0.1:{}", base + i as u16).parse().unwrap())
            .collect()
    }

    fn start_servers(
        addrs: &[SocketAddr],
        servers: i32,
        config: ServerConfig,
    ) -> Vec<JoinHandle<Result<i32, TaskmillError>>> {
        let size = addrs.len() as i32;
        (size - servers..size)
            .map(|rank| {
                let addrs = addrs.to_vec();
                let config = config.clone();
                tokio::spawn(async move {
                    let layout = Layout::new(size, servers, rank)?;
                    let mut server = Server::new_and_setup(layout, &addrs, config).await?;
                    server.run().await
                })
            })
            .collect()
    }

    async fn worker(
        addrs: &[SocketAddr],
        servers: i32,
        rank: Rank,
    ) -> Result<WorkerStub, TaskmillError> {
        let layout = Layout::new(addrs.len() as i32, servers, rank)?;
        WorkerStub::new_and_setup(layout, addrs).await
    }

    async fn join_all(
        workers: Vec<JoinHandle<Result<WorkerStub, TaskmillError>>>,
        servers: Vec<JoinHandle<Result<i32, TaskmillError>>>,
    ) -> Result<Vec<i32>, TaskmillError> {
        // hold worker stubs alive until every server has exited
        let mut stubs = Vec::new();
        for w in workers {
            stubs.push(w.await.unwrap()?);
        }
        let mut codes = Vec::new();
        for s in servers {
            codes.push(s.await.unwrap()?);
        }
        drop(stubs);
        Ok(codes)
    }

    const TEST_TIMEOUT: Duration = Duration::from_secs(60);

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn simple_store_retrieve_lifecycle() -> Result<(), TaskmillError> {
        time::timeout(TEST_TIMEOUT, async {
            let addrs = addrs(34000, 2);
            let servers = start_servers(&addrs, 1, ServerConfig::default());
            let a = addrs.clone();
            let w0 = tokio::spawn(async move {
                let mut w = worker(&a, 1, 0).await?;
                let id = w
                    .create(101, DataType::Integer, TypeExtra::None, CreateProps::default())
                    .await?
                    .unwrap();
                assert_eq!(id, 101);
                w.store(101, None, DataType::Integer, Value::Integer(42).pack(), RefCounts::NONE)
                    .await?
                    .unwrap();

                let (t, bytes) = w.retrieve(101, None, RetrieveRc::default()).await?.unwrap();
                assert_eq!(t, DataType::Integer);
                assert_eq!(bytes.len(), 8);
                assert_eq!(Value::unpack(t, &bytes).unwrap(), Value::Integer(42));

                // consume the read refcount
                let plan = RetrieveRc {
                    decr_self: RefCounts::READ,
                    incr_referand: RefCounts::NONE,
                };
                w.retrieve(101, None, plan).await?.unwrap();

                // dropping the write refcount destroys the datum
                w.refcount_incr(101, RefCounts { read: 0, write: -1 })
                    .await?
                    .unwrap();
                assert_eq!(
                    w.retrieve(101, None, RetrieveRc::default()).await?,
                    Err(DataError::NotFound)
                );

                assert_eq!(w.get(0).await?, GetOutcome::Shutdown);
                Ok::<_, TaskmillError>(w)
            });
            let codes = join_all(vec![w0], servers).await?;
            assert_eq!(codes, vec![0]);
            Ok(())
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn subscription_notifies_listener() -> Result<(), TaskmillError> {
        time::timeout(TEST_TIMEOUT, async {
            let addrs = addrs(34100, 3);
            let servers = start_servers(&addrs, 1, ServerConfig::default());
            let barrier = Arc::new(Barrier::new(2));

            let a = addrs.clone();
            let b = barrier.clone();
            let w0 = tokio::spawn(async move {
                let mut w = worker(&a, 1, 0).await?;
                b.wait().await; // container created
                assert!(w.subscribe(7, Some(b"k1")).await?.unwrap());
                b.wait().await; // subscription registered
                // the insertion notification arrives as a CONTROL task
                let GetOutcome::Work(got) = w.get(CONTROL_TYPE).await? else {
                    panic!("expected control work");
                };
                assert_eq!(got.payload, b"close 7 k1".to_vec());
                assert_eq!(got.work_type, CONTROL_TYPE);
                assert_eq!(w.get(CONTROL_TYPE).await?, GetOutcome::Shutdown);
                Ok::<_, TaskmillError>(w)
            });

            let a = addrs.clone();
            let b = barrier.clone();
            let w1 = tokio::spawn(async move {
                let mut w = worker(&a, 1, 1).await?;
                w.create(
                    7,
                    DataType::Container,
                    TypeExtra::Container {
                        key_type: DataType::Integer,
                        val_type: DataType::Ref,
                    },
                    CreateProps::default(),
                )
                .await?
                .unwrap();
                b.wait().await;
                b.wait().await; // wait for the subscription
                w.store(7, Some(b"k1"), DataType::Ref, Value::Ref(101).pack(), RefCounts::NONE)
                    .await?
                    .unwrap();
                assert_eq!(w.get(0).await?, GetOutcome::Shutdown);
                Ok::<_, TaskmillError>(w)
            });

            let codes = join_all(vec![w0, w1], servers).await?;
            assert_eq!(codes, vec![0]);
            Ok(())
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 6)]
    async fn notification_crosses_servers_through_sync() -> Result<(), TaskmillError> {
        time::timeout(TEST_TIMEOUT, async {
            // two servers: datum 7 lives on the second, its listener is
            // homed on the first, so the notification must hop via sync
            let addrs = addrs(34200, 4);
            let servers = start_servers(&addrs, 2, ServerConfig::default());
            let barrier = Arc::new(Barrier::new(2));

            let a = addrs.clone();
            let b = barrier.clone();
            let w0 = tokio::spawn(async move {
                let mut w = worker(&a, 2, 0).await?;
                b.wait().await;
                assert!(w.subscribe(7, Some(b"k1")).await?.unwrap());
                b.wait().await;
                let GetOutcome::Work(got) = w.get(CONTROL_TYPE).await? else {
                    panic!("expected control work");
                };
                assert_eq!(got.payload, b"close 7 k1".to_vec());
                assert_eq!(w.get(CONTROL_TYPE).await?, GetOutcome::Shutdown);
                Ok::<_, TaskmillError>(w)
            });

            let a = addrs.clone();
            let b = barrier.clone();
            let w1 = tokio::spawn(async move {
                let mut w = worker(&a, 2, 1).await?;
                w.create(
                    7,
                    DataType::Container,
                    TypeExtra::Container {
                        key_type: DataType::Integer,
                        val_type: DataType::Ref,
                    },
                    CreateProps::default(),
                )
                .await?
                .unwrap();
                b.wait().await;
                b.wait().await;
                w.store(7, Some(b"k1"), DataType::Ref, Value::Ref(101).pack(), RefCounts::NONE)
                    .await?
                    .unwrap();
                assert_eq!(w.get(0).await?, GetOutcome::Shutdown);
                Ok::<_, TaskmillError>(w)
            });

            let codes = join_all(vec![w0, w1], servers).await?;
            assert_eq!(codes, vec![0, 0]);
            Ok(())
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn insert_atomic_race_has_one_winner() -> Result<(), TaskmillError> {
        time::timeout(TEST_TIMEOUT, async {
            let addrs = addrs(34300, 3);
            let servers = start_servers(&addrs, 1, ServerConfig::default());
            let ready = Arc::new(Barrier::new(2));
            let stored = Arc::new(Barrier::new(2));

            let mut workers = Vec::new();
            for rank in 0..2 {
                let a = addrs.clone();
                let ready = ready.clone();
                let stored = stored.clone();
                workers.push(tokio::spawn(async move {
                    let mut w = worker(&a, 1, rank).await?;
                    if rank == 0 {
                        w.create(
                            7,
                            DataType::Container,
                            TypeExtra::Container {
                                key_type: DataType::String,
                                val_type: DataType::Ref,
                            },
                            CreateProps::default(),
                        )
                        .await?
                        .unwrap();
                    }
                    ready.wait().await;

                    let (created, present) = w.insert_atomic(7, b"k2").await?.unwrap();
                    assert!(!present);
                    if created {
                        // winner fills the reservation
                        w.store(7, Some(b"k2"), DataType::Ref, Value::Ref(55).pack(), RefCounts::NONE)
                            .await?
                            .unwrap();
                        stored.wait().await;
                    } else {
                        // loser's later store is a double write
                        stored.wait().await;
                        assert_eq!(
                            w.store(
                                7,
                                Some(b"k2"),
                                DataType::Ref,
                                Value::Ref(56).pack(),
                                RefCounts::NONE
                            )
                            .await?,
                            Err(DataError::DoubleWrite)
                        );
                        // and the reservation now reads as present
                        assert_eq!(w.insert_atomic(7, b"k2").await?.unwrap(), (false, true));
                    }
                    assert_eq!(w.get(0).await?, GetOutcome::Shutdown);
                    Ok::<_, TaskmillError>((w, created))
                }));
            }

            let mut stubs = Vec::new();
            let mut created_flags = Vec::new();
            for w in workers {
                let (stub, created) = w.await.unwrap()?;
                stubs.push(stub);
                created_flags.push(created);
            }
            // exactly one creator
            assert_eq!(created_flags.iter().filter(|&&c| c).count(), 1);
            for s in servers {
                assert_eq!(s.await.unwrap()?, 0);
            }
            drop(stubs);
            Ok(())
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn parallel_task_waits_for_full_team() -> Result<(), TaskmillError> {
        time::timeout(TEST_TIMEOUT, async {
            let addrs = addrs(34400, 5);
            let servers = start_servers(&addrs, 1, ServerConfig::default());

            let mut workers = Vec::new();
            for rank in 0..4 {
                let a = addrs.clone();
                workers.push(tokio::spawn(async move {
                    let mut w = worker(&a, 1, rank).await?;
                    if rank == 0 {
                        let st = w.put(b"team-task", ANY_RANK, NULL_RANK, 0, 5, 4).await?;
                        assert_eq!(st, Status::Success);
                    }
                    let GetOutcome::Work(got) = w.get(0).await? else {
                        panic!("expected parallel work");
                    };
                    assert_eq!(got.payload, b"team-task".to_vec());
                    let mut team = got.team.expect("parallel task carries team list");
                    team.sort_unstable();
                    assert_eq!(team, vec![0, 1, 2, 3]);
                    assert_eq!(w.get(0).await?, GetOutcome::Shutdown);
                    Ok::<_, TaskmillError>(w)
                }));
            }

            let codes = join_all(workers, servers).await?;
            assert_eq!(codes, vec![0]);
            Ok(())
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 6)]
    async fn steal_moves_work_to_starved_server() -> Result<(), TaskmillError> {
        time::timeout(TEST_TIMEOUT, async {
            // all tasks are submitted to the first server; the second
            // server's worker can only be fed through steals
            let addrs = addrs(34500, 4);
            let servers = start_servers(&addrs, 2, ServerConfig::default());

            let a = addrs.clone();
            let w0 = tokio::spawn(async move {
                let mut w = worker(&a, 2, 0).await?;
                for i in 0..6u8 {
                    let st = w.put(&[i], ANY_RANK, NULL_RANK, 0, 0, 1).await?;
                    assert_eq!(st, Status::Success);
                }
                w.finalize()?;
                Ok::<_, TaskmillError>(w)
            });

            let a = addrs.clone();
            let w1 = tokio::spawn(async move {
                let mut w = worker(&a, 2, 1).await?;
                let mut seen = Vec::new();
                loop {
                    match w.get(0).await? {
                        GetOutcome::Work(got) => seen.push(got.payload[0]),
                        GetOutcome::Shutdown => break,
                        GetOutcome::Nothing => unreachable!(),
                    }
                }
                seen.sort_unstable();
                assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
                Ok::<_, TaskmillError>(w)
            });

            let codes = join_all(vec![w0, w1], servers).await?;
            assert_eq!(codes, vec![0, 0]);
            Ok(())
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn large_payload_redirects_putter_to_worker() -> Result<(), TaskmillError> {
        time::timeout(TEST_TIMEOUT, async {
            let addrs = addrs(34600, 3);
            let servers = start_servers(&addrs, 1, ServerConfig::default());
            let barrier = Arc::new(Barrier::new(2));
            let payload: Vec<u8> = (0..200_000u32).map(|v| v as u8).collect();

            let a = addrs.clone();
            let b = barrier.clone();
            let expect = payload.clone();
            let w0 = tokio::spawn(async move {
                let mut w = worker(&a, 1, 0).await?;
                b.wait().await;
                let GetOutcome::Work(got) = w.get(0).await? else {
                    panic!("expected work");
                };
                assert_eq!(got.payload, expect);
                assert_eq!(got.answer, 1);
                assert_eq!(w.get(0).await?, GetOutcome::Shutdown);
                Ok::<_, TaskmillError>(w)
            });

            let a = addrs.clone();
            let b = barrier.clone();
            let w1 = tokio::spawn(async move {
                let mut w = worker(&a, 1, 1).await?;
                b.wait().await;
                // give the getter a moment to park, exercising the
                // worker-to-worker redirect path
                time::sleep(Duration::from_millis(300)).await;
                let st = w.put(&payload, ANY_RANK, 1, 0, 0, 1).await?;
                assert_eq!(st, Status::Success);
                assert_eq!(w.get(0).await?, GetOutcome::Shutdown);
                Ok::<_, TaskmillError>(w)
            });

            let codes = join_all(vec![w0, w1], servers).await?;
            assert_eq!(codes, vec![0]);
            Ok(())
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failure_code_becomes_exit_status() -> Result<(), TaskmillError> {
        time::timeout(TEST_TIMEOUT, async {
            let addrs = addrs(34700, 2);
            let servers = start_servers(&addrs, 1, ServerConfig::default());
            let a = addrs.clone();
            let w0 = tokio::spawn(async move {
                let mut w = worker(&a, 1, 0).await?;
                w.fail(42)?;
                assert_eq!(w.get(0).await?, GetOutcome::Shutdown);
                Ok::<_, TaskmillError>(w)
            });
            let codes = join_all(vec![w0], servers).await?;
            assert_eq!(codes, vec![42]);
            Ok(())
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 6)]
    async fn container_reference_writes_through_servers() -> Result<(), TaskmillError> {
        time::timeout(TEST_TIMEOUT, async {
            // the bound ref datum lives on one server, the container on the
            // other; resolution exercises the reference-write remote path
            let addrs = addrs(34800, 4);
            let servers = start_servers(&addrs, 2, ServerConfig::default());
            let barrier = Arc::new(Barrier::new(2));

            let a = addrs.clone();
            let b = barrier.clone();
            let w0 = tokio::spawn(async move {
                let mut w = worker(&a, 2, 0).await?;
                // ref target: id 10 homed on the first server
                w.create(10, DataType::Ref, TypeExtra::None, CreateProps::default())
                    .await?
                    .unwrap();
                // the referand named by the inserted value
                w.create(99, DataType::Integer, TypeExtra::None, CreateProps::default())
                    .await?
                    .unwrap();
                // container: id 7 homed on the second server
                w.create(
                    7,
                    DataType::Container,
                    TypeExtra::Container {
                        key_type: DataType::String,
                        val_type: DataType::Ref,
                    },
                    CreateProps {
                        read_refcount: 2,
                        ..Default::default()
                    },
                )
                .await?
                .unwrap();
                let deferred = w
                    .container_reference(7, b"key", 10, DataType::Ref)
                    .await?
                    .unwrap();
                assert!(deferred.is_none());
                b.wait().await;
                b.wait().await; // value inserted and resolved
                // poll until the reference write lands
                let mut got = None;
                for _ in 0..100 {
                    match w.retrieve(10, None, RetrieveRc::default()).await? {
                        Ok((t, bytes)) => {
                            got = Some(Value::unpack(t, &bytes).unwrap());
                            break;
                        }
                        Err(DataError::Unset) => {
                            time::sleep(Duration::from_millis(50)).await;
                        }
                        Err(e) => panic!("unexpected error {:?}", e),
                    }
                }
                assert_eq!(got, Some(Value::Ref(99)));
                assert_eq!(w.get(0).await?, GetOutcome::Shutdown);
                Ok::<_, TaskmillError>(w)
            });

            let a = addrs.clone();
            let b = barrier.clone();
            let w1 = tokio::spawn(async move {
                let mut w = worker(&a, 2, 1).await?;
                b.wait().await; // reference bound
                w.store(7, Some(b"key"), DataType::Ref, Value::Ref(99).pack(), RefCounts::NONE)
                    .await?
                    .unwrap();
                b.wait().await;
                assert_eq!(w.get(0).await?, GetOutcome::Shutdown);
                Ok::<_, TaskmillError>(w)
            });

            let codes = join_all(vec![w0, w1], servers).await?;
            assert_eq!(codes, vec![0, 0]);
            Ok(())
        })
        .await
        .unwrap()
    }
}

//! In-process messaging substrate.
//!
//! The partitions of the system are message-driven objects grouped
//! into branches, the process analog: one OS thread per reader. Each
//! branch owns its reader, the tree pieces and tree elements hashed to
//! it, and the branch-local singletons (cache, resumer, count
//! manager). A branch processes one message at a time, so branch state
//! needs no locking; messages from one sender arrive in send order
//! because mailboxes are FIFO channels.
//!
//! Quiescence detection is the inter-phase barrier: a shared counter
//! is incremented on every send and decremented after the handler
//! returns, so reaching zero means no message is queued or being
//! processed anywhere. Reduction contributions travel on a separate
//! reply channel that is not counted; the driver drains it after
//! quiescence and folds the contributions.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::error;

use crate::cache::{CacheManager, CacheStats, WireKind, WireNode};
use crate::config::Config;
use crate::constants::ROOT_KEY;
use crate::count::CountManager;
use crate::error::{TreecodeError, TreecodeResult};
use crate::node::CentroidData;
use crate::reader::Reader;
use crate::resumer::Resumer;
use crate::tree_element::{TeAction, TreeElement};
use crate::treepiece::{TpSend, TreePiece};
use crate::types::domain::BoundingBox;
use crate::types::morton::{parent, Key};
use crate::types::point::{Particle, Real};
use crate::types::splitter::Splitter;
use crate::visitors::count::CountVisitor;
use crate::visitors::density::DensityVisitor;
use crate::visitors::gravity::GravityVisitor;
use crate::visitors::pressure::PressureVisitor;
use crate::visitors::VisitorSpec;

/// Typed point-to-point messages between branches (and from the
/// driver).
#[derive(Clone, Debug)]
pub enum Msg {
    // Reader pool.
    ReaderReceive(Vec<Particle>),
    ComputeBounds,
    AssignKeys(BoundingBox),
    CountOct(Arc<Vec<(Key, Key)>>),
    SetSplitters(Arc<Vec<Splitter>>),
    CreateTreePieces { n_treepieces: usize },
    FlushParticles,
    // Tree pieces.
    TpReceive { tp: usize, particles: Vec<Particle> },
    CheckDelivery,
    BuildTrees,
    UpwardPass,
    StartTraversal(VisitorSpec),
    RequestNodes { tp: usize, key: Key, reply_to: usize },
    Perturb { dt: Real, rebuild: bool },
    CollectParticles,
    // Tree elements.
    TeReceiveData { key: Key, data: CentroidData, tp_index: i64 },
    TeRequestData { key: Key, reply_to: usize },
    // Caches.
    RecvStarterPack(Arc<Vec<(Key, CentroidData)>>),
    InstallNodes { key: Key, nodes: Vec<WireNode> },
    DestroyCaches { keep_starter: bool },
    CollectCacheStats,
    // Count manager.
    ConfigureBins { n_bins: usize, min: Real, max: Real },
    CollectBins,
    Shutdown,
}

/// Reduction contributions drained by the driver after quiescence.
#[derive(Clone, Debug)]
pub enum Reply {
    Bounds(BoundingBox),
    Counts(Vec<usize>),
    TeStorage(Key, CentroidData),
    TraversalDone { tp: usize },
    Particles(Vec<Particle>),
    Bins(Vec<u64>),
    Stats { cache: CacheStats, resumptions: u64 },
}

#[derive(Default)]
struct QState {
    in_flight: usize,
    failed: Option<String>,
}

/// The quiescence barrier shared by every sender.
#[derive(Default)]
pub struct Quiescence {
    state: Mutex<QState>,
    cv: Condvar,
}

impl Quiescence {
    fn launch(&self) {
        self.state.lock().unwrap().in_flight += 1;
    }

    fn settle(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.cv.notify_all();
        }
    }

    fn fail(&self, detail: String) {
        let mut state = self.state.lock().unwrap();
        state.failed.get_or_insert(detail);
        self.cv.notify_all();
    }

    fn wait(&self) -> TreecodeResult<()> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(detail) = &state.failed {
                return Err(TreecodeError::BranchFailure(detail.clone()));
            }
            if state.in_flight == 0 {
                return Ok(());
            }
            state = self.cv.wait(state).unwrap();
        }
    }
}

/// Sending half of the substrate, cloned into every branch.
#[derive(Clone)]
pub struct Comm {
    senders: Vec<Sender<Msg>>,
    replies: Sender<Reply>,
    quiescence: Arc<Quiescence>,
}

impl Comm {
    pub fn n_branches(&self) -> usize {
        self.senders.len()
    }

    pub fn send(&self, branch: usize, msg: Msg) {
        self.quiescence.launch();
        self.senders[branch]
            .send(msg)
            .expect("branch mailbox closed");
    }

    /// Contributions are not counted as in-flight: they land in the
    /// driver's always-ready sink and are folded after quiescence.
    pub fn reply(&self, reply: Reply) {
        let _ = self.replies.send(reply);
    }

    /// Branch hosting a tree piece.
    pub fn tp_branch(&self, tp: usize) -> usize {
        tp % self.n_branches()
    }

    /// Branch hosting a tree element.
    pub fn te_branch(&self, key: Key) -> usize {
        (key % self.n_branches() as u64) as usize
    }
}

/// One process branch: a reader, the objects hashed to this branch and
/// the branch-local singletons.
struct Branch {
    index: usize,
    comm: Comm,
    config: Arc<Config>,
    reader: Reader,
    treepieces: HashMap<usize, TreePiece>,
    elements: HashMap<Key, TreeElement>,
    cache: CacheManager,
    resumer: Resumer,
    counts: CountManager,
    splitters: Arc<Vec<Splitter>>,
    /// Traversal this iteration is running; set while downward
    /// traversals may suspend and resume.
    active: Option<VisitorSpec>,
}

impl Branch {
    fn new(index: usize, comm: Comm, config: Arc<Config>) -> Self {
        Branch {
            index,
            comm,
            config,
            reader: Reader::default(),
            treepieces: HashMap::new(),
            elements: HashMap::new(),
            cache: CacheManager::default(),
            resumer: Resumer::default(),
            counts: CountManager::default(),
            splitters: Arc::new(Vec::new()),
            active: None,
        }
    }

    fn handle(&mut self, msg: Msg) -> TreecodeResult<()> {
        match msg {
            Msg::ReaderReceive(particles) => {
                self.reader.receive(particles);
                Ok(())
            }
            Msg::ComputeBounds => {
                self.comm.reply(Reply::Bounds(self.reader.local_bounding_box()));
                Ok(())
            }
            Msg::AssignKeys(universe) => {
                self.reader.assign_keys(&universe);
                Ok(())
            }
            Msg::CountOct(ranges) => {
                self.comm.reply(Reply::Counts(self.reader.count_oct(&ranges)));
                Ok(())
            }
            Msg::SetSplitters(splitters) => {
                self.splitters = splitters;
                Ok(())
            }
            Msg::CreateTreePieces { n_treepieces } => {
                self.treepieces.clear();
                self.elements.clear();
                let mut tp = self.index;
                while tp < n_treepieces {
                    self.treepieces.insert(
                        tp,
                        TreePiece::new(tp, &self.splitters[tp], self.config.max_particles_per_leaf),
                    );
                    tp += self.comm.n_branches();
                }
                Ok(())
            }
            Msg::FlushParticles => {
                for (tp, particles) in self.reader.flush(&self.splitters) {
                    self.comm
                        .send(self.comm.tp_branch(tp), Msg::TpReceive { tp, particles });
                }
                Ok(())
            }
            Msg::TpReceive { tp, particles } => {
                self.piece_mut(tp)?.receive(particles);
                Ok(())
            }
            Msg::CheckDelivery => {
                for piece in self.treepieces.values() {
                    piece.check()?;
                }
                Ok(())
            }
            Msg::BuildTrees => {
                let splitters = self.splitters.clone();
                for piece in self.treepieces.values_mut() {
                    piece.build(&splitters)?;
                }
                Ok(())
            }
            Msg::UpwardPass => {
                let Branch {
                    comm, treepieces, ..
                } = self;
                for piece in treepieces.values_mut() {
                    let mut out = Vec::new();
                    piece.up_only(&mut out);
                    for send in out {
                        match send {
                            TpSend::Contribute { key, data } => comm.send(
                                comm.te_branch(key),
                                Msg::TeReceiveData {
                                    key,
                                    data,
                                    tp_index: piece.index as i64,
                                },
                            ),
                            other => {
                                return Err(TreecodeError::invariant(
                                    piece.index as i64,
                                    format!("upward pass produced {:?}", other),
                                ))
                            }
                        }
                    }
                }
                Ok(())
            }
            Msg::StartTraversal(spec) => {
                self.active = Some(spec);
                let Branch {
                    index,
                    comm,
                    treepieces,
                    cache,
                    resumer,
                    counts,
                    splitters,
                    ..
                } = self;
                for piece in treepieces.values_mut() {
                    let start_keys = piece.start_traversal(&spec);
                    if start_keys.is_empty() {
                        // No buckets: one empty descent signals done.
                        dispatch_go_down(
                            piece, ROOT_KEY, &spec, cache, resumer, counts, splitters, comm, *index,
                        );
                    }
                    for key in start_keys {
                        dispatch_go_down(
                            piece, key, &spec, cache, resumer, counts, splitters, comm, *index,
                        );
                    }
                }
                Ok(())
            }
            Msg::RequestNodes { tp, key, reply_to } => {
                let nodes = self.piece(tp)?.request_nodes(key)?;
                self.comm.send(reply_to, Msg::InstallNodes { key, nodes });
                Ok(())
            }
            Msg::TeReceiveData {
                key,
                data,
                tp_index,
            } => {
                let element = self.elements.entry(key).or_default();
                if let TeAction::Complete(total) = element.receive_data(data, tp_index) {
                    self.comm.reply(Reply::TeStorage(key, total));
                    if key != ROOT_KEY {
                        let up = parent(key);
                        self.comm.send(
                            self.comm.te_branch(up),
                            Msg::TeReceiveData {
                                key: up,
                                data: total,
                                tp_index: -1,
                            },
                        );
                    }
                }
                Ok(())
            }
            Msg::TeRequestData { key, reply_to } => {
                let element = self.elements.get(&key).ok_or_else(|| {
                    TreecodeError::invariant(-1, format!("fetch for unknown element {:o}", key))
                })?;
                let data = element.request_data().ok_or_else(|| {
                    TreecodeError::invariant(
                        -1,
                        format!("element {:o} fetched before aggregation completed", key),
                    )
                })?;
                let node = WireNode {
                    key,
                    kind: WireKind::Boundary,
                    data,
                    owner_tp: element.tp_index(),
                    particles: Vec::new(),
                };
                self.comm
                    .send(reply_to, Msg::InstallNodes { key, nodes: vec![node] });
                Ok(())
            }
            Msg::RecvStarterPack(pack) => {
                self.cache.recv_starter_pack(&pack);
                Ok(())
            }
            Msg::InstallNodes { key, nodes } => {
                self.cache.install(nodes);
                let waiters = self.cache.take_waiters(key);
                let waiters = self.resumer.resolve(key, waiters);
                let spec = self.active.ok_or_else(|| {
                    TreecodeError::invariant(-1, "node reply with no traversal active")
                })?;
                let Branch {
                    index,
                    comm,
                    treepieces,
                    cache,
                    resumer,
                    counts,
                    splitters,
                    ..
                } = self;
                for tp in waiters {
                    let piece = treepieces.get_mut(&tp).ok_or_else(|| {
                        TreecodeError::invariant(tp as i64, "resumed piece not on this branch")
                    })?;
                    dispatch_go_down(
                        piece, key, &spec, cache, resumer, counts, splitters, comm, *index,
                    );
                }
                Ok(())
            }
            Msg::Perturb { dt, rebuild } => {
                let Branch {
                    index,
                    comm,
                    treepieces,
                    ..
                } = self;
                for piece in treepieces.values_mut() {
                    piece.perturb(dt);
                    if rebuild {
                        let particles = piece.take_particles();
                        if !particles.is_empty() {
                            comm.send(*index, Msg::ReaderReceive(particles));
                        }
                    }
                }
                Ok(())
            }
            Msg::CollectParticles => {
                let mut all = Vec::new();
                for piece in self.treepieces.values() {
                    all.extend_from_slice(piece.particles());
                }
                self.comm.reply(Reply::Particles(all));
                Ok(())
            }
            Msg::DestroyCaches { keep_starter } => {
                self.cache.destroy(keep_starter);
                self.resumer.destroy();
                self.elements.clear();
                self.active = None;
                Ok(())
            }
            Msg::CollectCacheStats => {
                self.comm.reply(Reply::Stats {
                    cache: self.cache.take_stats(),
                    resumptions: self.resumer.take_resumptions(),
                });
                Ok(())
            }
            Msg::ConfigureBins { n_bins, min, max } => {
                self.counts.configure(n_bins, min, max);
                Ok(())
            }
            Msg::CollectBins => {
                self.comm.reply(Reply::Bins(self.counts.take()));
                Ok(())
            }
            Msg::Shutdown => Ok(()),
        }
    }

    fn piece(&self, tp: usize) -> TreecodeResult<&TreePiece> {
        self.treepieces
            .get(&tp)
            .ok_or_else(|| TreecodeError::invariant(tp as i64, "piece not on this branch"))
    }

    fn piece_mut(&mut self, tp: usize) -> TreecodeResult<&mut TreePiece> {
        self.treepieces
            .get_mut(&tp)
            .ok_or_else(|| TreecodeError::invariant(tp as i64, "piece not on this branch"))
    }
}

/// Run one `go_down` with the visitor named by the spec, then turn the
/// piece's outbound effects into messages.
#[allow(clippy::too_many_arguments)]
fn dispatch_go_down(
    piece: &mut TreePiece,
    key: Key,
    spec: &VisitorSpec,
    cache: &mut CacheManager,
    resumer: &mut Resumer,
    counts: &mut CountManager,
    splitters: &Arc<Vec<Splitter>>,
    comm: &Comm,
    branch: usize,
) {
    let mut sends = Vec::new();
    match *spec {
        VisitorSpec::Gravity { theta } => {
            let mut v = GravityVisitor { theta };
            piece.go_down(key, &mut v, cache, resumer, splitters, &mut sends);
        }
        VisitorSpec::Density { radius } => {
            let mut v = DensityVisitor::new(radius);
            piece.go_down(key, &mut v, cache, resumer, splitters, &mut sends);
        }
        VisitorSpec::Pressure { radius } => {
            let mut v = PressureVisitor::new(radius);
            piece.go_down(key, &mut v, cache, resumer, splitters, &mut sends);
        }
        VisitorSpec::Count => {
            let mut v = CountVisitor { manager: counts };
            piece.go_down(key, &mut v, cache, resumer, splitters, &mut sends);
        }
    }

    for send in sends {
        match send {
            TpSend::RequestTe { key } => {
                comm.send(comm.te_branch(key), Msg::TeRequestData { key, reply_to: branch });
            }
            TpSend::RequestTp { key, owner } => comm.send(
                comm.tp_branch(owner),
                Msg::RequestNodes {
                    tp: owner,
                    key,
                    reply_to: branch,
                },
            ),
            TpSend::Done => comm.reply(Reply::TraversalDone { tp: piece.index }),
            TpSend::Contribute { .. } => {}
        }
    }
}

fn branch_main(index: usize, comm: Comm, config: Arc<Config>, mailbox: Receiver<Msg>) {
    let mut branch = Branch::new(index, comm.clone(), config);
    let mut failed = false;
    while let Ok(msg) = mailbox.recv() {
        let shutdown = matches!(msg, Msg::Shutdown);
        if !shutdown && !failed {
            // A panicking handler must surface as a job abort, not
            // hang the quiescence barrier.
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| branch.handle(msg)));
            let detail = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(panic) => Some(panic_message(panic)),
            };
            if let Some(detail) = detail {
                error!("[branch {}] aborting: {}", index, detail);
                comm.quiescence.fail(detail);
                failed = true;
            }
        }
        // Settle after the handler so quiescence implies every send the
        // handler performed has been counted.
        comm.quiescence.settle();
        if shutdown {
            break;
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// The spawned substrate: branch threads, their mailboxes and the
/// reply sink.
pub struct Runtime {
    comm: Comm,
    replies: Receiver<Reply>,
    handles: Vec<JoinHandle<()>>,
    shut_down: bool,
}

impl Runtime {
    pub fn spawn(n_branches: usize, config: Arc<Config>) -> Runtime {
        let quiescence = Arc::new(Quiescence::default());
        let (reply_tx, reply_rx) = unbounded();

        let mut senders = Vec::with_capacity(n_branches);
        let mut mailboxes = Vec::with_capacity(n_branches);
        for _ in 0..n_branches {
            let (tx, rx) = unbounded();
            senders.push(tx);
            mailboxes.push(rx);
        }

        let comm = Comm {
            senders,
            replies: reply_tx,
            quiescence,
        };

        let handles = mailboxes
            .into_iter()
            .enumerate()
            .map(|(index, mailbox)| {
                let comm = comm.clone();
                let config = config.clone();
                thread::Builder::new()
                    .name(format!("branch-{}", index))
                    .spawn(move || branch_main(index, comm, config, mailbox))
                    .expect("failed to spawn branch thread")
            })
            .collect();

        Runtime {
            comm,
            replies: reply_rx,
            handles,
            shut_down: false,
        }
    }

    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    pub fn broadcast(&self, msg: Msg) {
        for branch in 0..self.comm.n_branches() {
            self.comm.send(branch, msg.clone());
        }
    }

    /// Block until no message is queued or in processing anywhere.
    pub fn wait_quiescence(&self) -> TreecodeResult<()> {
        self.comm.quiescence.wait()
    }

    /// Contributions accumulated since the last drain. Only meaningful
    /// after a quiescence wait.
    pub fn drain_replies(&self) -> Vec<Reply> {
        self.replies.try_iter().collect()
    }

    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.broadcast(Msg::Shutdown);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Data-flow task graph
//!
//! Every pipeline step is a task that declares the synchronization tokens it
//! reads and writes. Dependencies follow reader/writer semantics in insertion
//! order: a reader waits for the last writer of each token, a writer waits for
//! the last writer and every reader since. The resulting [`Plan`] can be
//! inspected on its own; [`TaskGraph::execute`] runs it on a worker pool,
//! always dispatching the highest-priority ready task first.

use blockflow_core::{Error, ExecutionEngine, ParallelEngine, Result};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Synchronization token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    /// Block-row (trsm) or block-column (getrf) `k`
    Block(usize),
    /// Diagonal tile of step `k`
    Diag(usize),
    /// Communication order; every task that sends or receives writes it
    Comm,
}

/// Dispatch priority of a ready task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Panel,
    Broadcast,
    LookaheadComm,
    Lookahead,
    TrailingComm,
    Trailing,
    Cleanup,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Panel => "panel",
            TaskKind::Broadcast => "broadcast",
            TaskKind::LookaheadComm => "lookahead_comm",
            TaskKind::Lookahead => "lookahead",
            TaskKind::TrailingComm => "trailing_comm",
            TaskKind::Trailing => "trailing",
            TaskKind::Cleanup => "cleanup",
        }
    }
}

/// Declaration of one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub kind: TaskKind,
    /// Sweep step the task belongs to
    pub step: usize,
    /// Destination block of lookahead tasks
    pub index: Option<usize>,
    pub priority: Priority,
    pub reads: Vec<Token>,
    pub writes: Vec<Token>,
}

impl TaskSpec {
    pub fn new(kind: TaskKind, step: usize, priority: Priority) -> Self {
        Self {
            kind,
            step,
            index: None,
            priority,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn reads(mut self, token: Token) -> Self {
        if !self.reads.contains(&token) {
            self.reads.push(token);
        }
        self
    }

    pub fn writes(mut self, token: Token) -> Self {
        if !self.writes.contains(&token) {
            self.writes.push(token);
        }
        self
    }

    /// Whether the task takes part in inter-rank communication
    pub fn communicates(&self) -> bool {
        self.writes.contains(&Token::Comm)
    }
}

impl fmt::Display for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}[{}->{}]", self.kind.name(), self.step, index),
            None => write!(f, "{}[{}]", self.kind.name(), self.step),
        }
    }
}

/// Task declarations and their dependency edges
#[derive(Debug, Clone, Default)]
pub struct Plan {
    tasks: Vec<TaskSpec>,
    deps: Vec<Vec<usize>>,
    last_writer: HashMap<Token, usize>,
    readers: HashMap<Token, Vec<usize>>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a plan from declarations in insertion order
    pub fn from_specs(specs: impl IntoIterator<Item = TaskSpec>) -> Self {
        let mut plan = Self::new();
        for spec in specs {
            plan.push(spec);
        }
        plan
    }

    /// Append a task; returns its id
    pub fn push(&mut self, spec: TaskSpec) -> usize {
        let id = self.tasks.len();
        let mut deps = Vec::new();
        for token in &spec.reads {
            if spec.writes.contains(token) {
                continue;
            }
            if let Some(&writer) = self.last_writer.get(token) {
                deps.push(writer);
            }
        }
        for token in &spec.writes {
            if let Some(&writer) = self.last_writer.get(token) {
                deps.push(writer);
            }
            if let Some(readers) = self.readers.get(token) {
                deps.extend(readers.iter().copied());
            }
        }
        deps.sort_unstable();
        deps.dedup();

        for token in &spec.reads {
            if !spec.writes.contains(token) {
                self.readers.entry(*token).or_default().push(id);
            }
        }
        for token in &spec.writes {
            self.last_writer.insert(*token, id);
            self.readers.remove(token);
        }
        self.tasks.push(spec);
        self.deps.push(deps);
        id
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Direct predecessors of a task
    pub fn dependencies(&self, id: usize) -> &[usize] {
        &self.deps[id]
    }

    pub fn find(&self, kind: TaskKind, step: usize, index: Option<usize>) -> Option<usize> {
        self.tasks
            .iter()
            .position(|t| t.kind == kind && t.step == step && t.index == index)
    }

    pub fn count(&self, kind: TaskKind) -> usize {
        self.tasks.iter().filter(|t| t.kind == kind).count()
    }

    /// `task` has a direct edge from `on`
    pub fn depends_on(&self, task: usize, on: usize) -> bool {
        self.deps[task].binary_search(&on).is_ok()
    }

    /// `first` must finish before `then` may start
    pub fn precedes(&self, first: usize, then: usize) -> bool {
        if first >= then {
            return false;
        }
        let mut visited = vec![false; then + 1];
        let mut stack = vec![then];
        while let Some(id) = stack.pop() {
            for &dep in &self.deps[id] {
                if dep == first {
                    return true;
                }
                if dep > first && !visited[dep] {
                    visited[dep] = true;
                    stack.push(dep);
                }
            }
        }
        false
    }

    /// Tasks each task unblocks
    fn dependents(&self) -> Vec<Vec<usize>> {
        let mut dependents = vec![Vec::new(); self.tasks.len()];
        for (id, deps) in self.deps.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(id);
            }
        }
        dependents
    }
}

/// Work of one task
pub type TaskBody<'a> = Box<dyn FnOnce() -> Result<()> + Send + 'a>;

/// Plan plus the work of each task
pub struct TaskGraph<'a> {
    plan: Plan,
    bodies: Vec<TaskBody<'a>>,
}

impl<'a> Default for TaskGraph<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> TaskGraph<'a> {
    pub fn new() -> Self {
        Self {
            plan: Plan::new(),
            bodies: Vec::new(),
        }
    }

    pub fn add<F>(&mut self, spec: TaskSpec, body: F) -> usize
    where
        F: FnOnce() -> Result<()> + Send + 'a,
    {
        self.bodies.push(Box::new(body));
        self.plan.push(spec)
    }

    /// Add every declaration of a schedule, building each body from its spec
    pub fn from_schedule<F>(specs: Vec<TaskSpec>, mut build: F) -> Self
    where
        F: FnMut(&TaskSpec) -> TaskBody<'a>,
    {
        let mut graph = Self::new();
        for spec in specs {
            let body = build(&spec);
            graph.bodies.push(body);
            graph.plan.push(spec);
        }
        graph
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Run every task on the engine's pool
    ///
    /// `on_failure` is called once, with the first error, as soon as it
    /// happens; no task is dispatched after that. Tasks already running are
    /// allowed to finish. Returns the number of tasks that completed.
    pub fn execute(
        self,
        engine: &ParallelEngine,
        on_failure: &(dyn Fn(&Error) + Sync),
    ) -> Result<usize> {
        let TaskGraph { plan, bodies } = self;
        if plan.is_empty() {
            return Ok(0);
        }
        let dependents = plan.dependents();
        let mut ready = BinaryHeap::new();
        let pending: Vec<usize> = plan.deps.iter().map(Vec::len).collect();
        for (id, &count) in pending.iter().enumerate() {
            if count == 0 {
                ready.push(Ready {
                    priority: plan.tasks[id].priority,
                    id,
                });
            }
        }
        let initial = ready.len();
        let scheduler = Scheduler {
            plan: &plan,
            dependents,
            state: Mutex::new(State {
                pending,
                ready,
                bodies: bodies.into_iter().map(Some).collect(),
                completed: 0,
                error: None,
            }),
            failed: AtomicBool::new(false),
            on_failure,
        };

        tracing::debug!(tasks = plan.len(), initial, "executing task graph");
        engine.execute(|| {
            rayon::scope(|scope| {
                for _ in 0..initial {
                    let scheduler = &scheduler;
                    scope.spawn(move |scope| scheduler.run_one(scope));
                }
            })
        });

        let state = scheduler.state.into_inner();
        match state.error {
            Some(err) => Err(err),
            None if state.completed == plan.len() => Ok(state.completed),
            None => Err(Error::Execution(format!(
                "task graph stalled after {} of {} tasks",
                state.completed,
                plan.len()
            ))),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Ready {
    priority: Priority,
    id: usize,
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first, then earlier insertion
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct State<'a> {
    pending: Vec<usize>,
    ready: BinaryHeap<Ready>,
    bodies: Vec<Option<TaskBody<'a>>>,
    completed: usize,
    error: Option<Error>,
}

struct Scheduler<'p, 'a> {
    plan: &'p Plan,
    dependents: Vec<Vec<usize>>,
    state: Mutex<State<'a>>,
    failed: AtomicBool,
    on_failure: &'p (dyn Fn(&Error) + Sync),
}

impl<'p, 'a> Scheduler<'p, 'a> {
    /// Take the best ready task, run it and spawn one worker per task it unblocks
    fn run_one<'s>(&'s self, scope: &rayon::Scope<'s>) {
        if self.failed.load(Ordering::Acquire) {
            return;
        }
        let (id, body) = {
            let mut state = self.state.lock();
            if state.error.is_some() {
                return;
            }
            let Some(Ready { id, .. }) = state.ready.pop() else {
                return;
            };
            match state.bodies[id].take() {
                Some(body) => (id, body),
                None => return,
            }
        };

        let spec = &self.plan.tasks[id];
        tracing::trace!(task = %spec, "task started");
        let result = body();

        let unblocked = match result {
            Ok(()) => {
                tracing::trace!(task = %spec, "task finished");
                let mut state = self.state.lock();
                state.completed += 1;
                let mut unblocked = 0;
                for &next in &self.dependents[id] {
                    state.pending[next] -= 1;
                    if state.pending[next] == 0 {
                        state.ready.push(Ready {
                            priority: self.plan.tasks[next].priority,
                            id: next,
                        });
                        unblocked += 1;
                    }
                }
                if self.failed.load(Ordering::Acquire) {
                    0
                } else {
                    unblocked
                }
            }
            Err(err) => {
                tracing::debug!(task = %spec, error = %err, "task failed");
                if !self.failed.swap(true, Ordering::AcqRel) {
                    (self.on_failure)(&err);
                    let mut state = self.state.lock();
                    state.error = Some(err);
                }
                0
            }
        };

        for _ in 0..unblocked {
            scope.spawn(move |scope| self.run_one(scope));
        }
    }
}

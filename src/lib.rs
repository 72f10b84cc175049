use rand::Rng;
use rand_mt::Mt64;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error as ThisError;

pub fn integer_values(values: &[f64]) -> Result<Vec<i32>, Error> {
    let mut out = Vec::with_capacity(values.len());
    for (idx, &x) in values.iter().enumerate() {
        if !x.is_finite()
            || x.fract() != 0.0
            || x < f64::from(i32::MIN)
            || x > f64::from(i32::MAX)
        {
            return Err(Error::InvalidInput(format!(
                "matrix value {x} at index {idx} is not a representable integer"
            )));
        }
        out.push(x as i32);
    }
    Ok(out)
}

fn wall_clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn effective_thread_count(requested: usize, n_nodes: usize) -> usize {
    let auto = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let n = if requested == 0 { auto } else { requested };
    n.clamp(1, n_nodes)
}

#[inline]
fn uniform_pos(rng: &mut Mt64) -> f64 {
    // open at zero so the logarithm stays finite
    1.0 - rng.gen::<f64>()
}

#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum Error {
    #[error("failed to allocate {0}")]
    Alloc(&'static str),
    #[error("transition {transition} returned a non-finite or negative rate in node {node}")]
    InvalidRate { node: usize, transition: usize },
    #[error("compartment count would become negative in node {node}")]
    NegativeState { node: usize },
    #[error("invalid scheduled event at index {index}: {reason}")]
    InvalidEvent { index: usize, reason: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("post-timestep callback failed in node {node} with status {status}")]
    PostStep { node: usize, status: i32 },
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidInput(msg.into())
}

#[derive(Clone, Copy, Debug)]
pub struct CscView<'a> {
    nrow: usize,
    ncol: usize,
    jc: &'a [usize],
    ir: &'a [usize],
    values: Option<&'a [i32]>,
}

impl<'a> CscView<'a> {
    pub fn pattern(
        nrow: usize,
        ncol: usize,
        jc: &'a [usize],
        ir: &'a [usize],
    ) -> Result<Self, Error> {
        Self::build(nrow, ncol, jc, ir, None)
    }

    pub fn with_values(
        nrow: usize,
        ncol: usize,
        jc: &'a [usize],
        ir: &'a [usize],
        values: &'a [i32],
    ) -> Result<Self, Error> {
        Self::build(nrow, ncol, jc, ir, Some(values))
    }

    fn build(
        nrow: usize,
        ncol: usize,
        jc: &'a [usize],
        ir: &'a [usize],
        values: Option<&'a [i32]>,
    ) -> Result<Self, Error> {
        if jc.len() != ncol + 1 {
            return Err(invalid(format!(
                "column pointer length {} does not match {} columns",
                jc.len(),
                ncol
            )));
        }
        if jc[0] != 0 || jc.windows(2).any(|w| w[1] < w[0]) {
            return Err(invalid(
                "column pointers must start at 0 and be non-decreasing",
            ));
        }
        if jc[ncol] != ir.len() {
            return Err(invalid(format!(
                "row index length {} does not match final column pointer {}",
                ir.len(),
                jc[ncol]
            )));
        }
        if ir.iter().any(|&r| r >= nrow) {
            return Err(invalid(format!("row index exceeds {nrow} rows")));
        }
        if let Some(v) = values {
            if v.len() != ir.len() {
                return Err(invalid(format!(
                    "value length {} does not match {} stored entries",
                    v.len(),
                    ir.len()
                )));
            }
        }
        Ok(Self {
            nrow,
            ncol,
            jc,
            ir,
            values,
        })
    }

    pub fn nrow(&self) -> usize {
        self.nrow
    }

    pub fn ncol(&self) -> usize {
        self.ncol
    }

    fn col_rows(&self, j: usize) -> &'a [usize] {
        &self.ir[self.jc[j]..self.jc[j + 1]]
    }

    fn col(&self, j: usize) -> impl Iterator<Item = (usize, i32)> + 'a {
        let lo = self.jc[j];
        let hi = self.jc[j + 1];
        let values = self.values;
        self.ir[lo..hi]
            .iter()
            .enumerate()
            .map(move |(k, &row)| (row, values.map_or(1, |v| v[lo + k])))
    }

    fn value_at(&self, row: usize, col: usize) -> i32 {
        for k in self.jc[col]..self.jc[col + 1] {
            if self.ir[k] == row {
                return self.values.map_or(1, |v| v[k]);
            }
        }
        0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Exit = 0,
    Enter = 1,
    InternalTransfer = 2,
    ExternalTransfer = 3,
}

impl TryFrom<i32> for EventKind {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Exit),
            1 => Ok(Self::Enter),
            2 => Ok(Self::InternalTransfer),
            3 => Ok(Self::ExternalTransfer),
            other => Err(invalid(format!(
                "unsupported event kind code {} (expected 0=exit, 1=enter, 2=internal transfer, or 3=external transfer)",
                other
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EventTable<'a> {
    pub kind: &'a [i32],
    pub time: &'a [i32],
    pub node: &'a [usize],
    pub dest: &'a [usize],
    pub n: &'a [i32],
    pub proportion: &'a [f64],
    pub select: &'a [usize],
    pub shift: &'a [i32],
}

impl EventTable<'_> {
    fn checked_len(&self) -> Result<usize, Error> {
        let len = self.kind.len();
        let lens = [
            self.time.len(),
            self.node.len(),
            self.dest.len(),
            self.n.len(),
            self.proportion.len(),
            self.select.len(),
            self.shift.len(),
        ];
        if lens.iter().any(|&l| l != len) {
            return Err(invalid("event arrays must all have the same length"));
        }
        Ok(len)
    }
}

#[derive(Clone, Copy, Debug)]
struct ScheduledEvent {
    kind: EventKind,
    time: i32,
    node: usize,
    dest: usize,
    n: i32,
    proportion: f64,
    select: usize,
    shift: i32,
}

#[derive(Debug, Default)]
struct EventQueue {
    events: Vec<ScheduledEvent>,
    cursor: usize,
}

impl EventQueue {
    fn next_due(&self, day: f64) -> Option<ScheduledEvent> {
        let ev = *self.events.get(self.cursor)?;
        (f64::from(ev.time) <= day).then_some(ev)
    }

    fn advance(&mut self) {
        self.cursor += 1;
    }
}

fn build_event(
    table: &EventTable<'_>,
    index: usize,
    n_nodes: usize,
    select_matrix: &CscView<'_>,
    shift_matrix: &CscView<'_>,
) -> Result<ScheduledEvent, Error> {
    let reject = |reason: String| Error::InvalidEvent { index, reason };

    let kind = EventKind::try_from(table.kind[index])
        .map_err(|_| reject(format!("unsupported event kind code {}", table.kind[index])))?;
    let node = table.node[index];
    if node >= n_nodes {
        return Err(reject(format!("node {node} is out of range")));
    }
    let dest = table.dest[index];
    if kind == EventKind::ExternalTransfer && dest >= n_nodes {
        return Err(reject(format!("destination {dest} is out of range")));
    }
    let n = table.n[index];
    if n < 0 {
        return Err(reject(format!("negative individual count {n}")));
    }
    let proportion = table.proportion[index];
    if !(0.0..=1.0).contains(&proportion) {
        return Err(reject(format!("proportion {proportion} is outside [0, 1]")));
    }
    let select = table.select[index];
    if select >= select_matrix.ncol() {
        return Err(reject(format!("select column {select} is out of range")));
    }
    if select_matrix.col_rows(select).is_empty() {
        return Err(reject(format!("select column {select} is empty")));
    }
    let shift = table.shift[index];
    let shift_applies = match kind {
        EventKind::InternalTransfer => {
            if shift < 0 || shift as usize >= shift_matrix.ncol() {
                return Err(reject(format!("shift column {shift} is out of range")));
            }
            true
        }
        EventKind::ExternalTransfer => {
            if shift >= 0 && shift as usize >= shift_matrix.ncol() {
                return Err(reject(format!("shift column {shift} is out of range")));
            }
            shift >= 0
        }
        EventKind::Exit | EventKind::Enter => false,
    };
    if shift_applies {
        let nc = select_matrix.nrow();
        for &c in select_matrix.col_rows(select) {
            let target = c as i64 + i64::from(shift_matrix.value_at(c, shift as usize));
            if target < 0 || target >= nc as i64 {
                return Err(reject(format!(
                    "shift column {shift} moves compartment {c} out of range"
                )));
            }
        }
    }

    Ok(ScheduledEvent {
        kind,
        time: table.time[index],
        node,
        dest,
        n,
        proportion,
        select,
        shift,
    })
}

fn split_events(
    table: &EventTable<'_>,
    n_nodes: usize,
    select_matrix: &CscView<'_>,
    shift_matrix: &CscView<'_>,
    plan: &PartitionPlan,
) -> Result<(Vec<EventQueue>, EventQueue), Error> {
    let len = table.checked_len()?;

    let mut parsed = Vec::new();
    parsed
        .try_reserve_exact(len)
        .map_err(|_| Error::Alloc("event stream"))?;
    for index in 0..len {
        parsed.push(build_event(table, index, n_nodes, select_matrix, shift_matrix)?);
    }

    let mut counts = vec![0usize; plan.parts.len()];
    let mut inter_count = 0usize;
    for ev in &parsed {
        if ev.kind == EventKind::ExternalTransfer {
            inter_count += 1;
        } else {
            counts[plan.owner(ev.node)] += 1;
        }
    }

    let mut intra: Vec<EventQueue> = (0..plan.parts.len())
        .map(|_| EventQueue::default())
        .collect();
    for (queue, &count) in intra.iter_mut().zip(&counts) {
        queue
            .events
            .try_reserve_exact(count)
            .map_err(|_| Error::Alloc("intra-node event queue"))?;
    }
    let mut inter = EventQueue::default();
    inter
        .events
        .try_reserve_exact(inter_count)
        .map_err(|_| Error::Alloc("inter-node event queue"))?;

    for ev in parsed {
        if ev.kind == EventKind::ExternalTransfer {
            inter.events.push(ev);
        } else {
            intra[plan.owner(ev.node)].events.push(ev);
        }
    }

    Ok((intra, inter))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostStep {
    Error(i32),
    NoUpdate,
    Update,
}

pub trait Model: Sync {
    fn rate(
        &self,
        transition: usize,
        u: &[i32],
        v: &[f64],
        ldata: &[f64],
        gdata: &[f64],
        t: f64,
    ) -> f64;

    fn post_step(
        &self,
        v_new: &mut [f64],
        _u: &[i32],
        v: &[f64],
        _ldata: &[f64],
        _gdata: &[f64],
        _node: usize,
        _t: f64,
    ) -> PostStep {
        // post_step must fully populate v_new, the state the next day reads
        v_new.copy_from_slice(v);
        PostStep::NoUpdate
    }
}

pub enum StateOutput<'a, T> {
    Dense(&'a mut [T]),
    Sparse {
        jc: &'a [usize],
        ir: &'a [usize],
        pr: &'a mut [f64],
    },
}

pub struct SolverOutput<'a> {
    pub u: StateOutput<'a, i32>,
    pub v: StateOutput<'a, f64>,
}

#[derive(Clone, Copy)]
pub struct SolverArgs<'a> {
    pub u0: &'a [i32],
    pub v0: &'a [f64],
    pub dep_graph: CscView<'a>,
    pub state_change: CscView<'a>,
    pub select_matrix: CscView<'a>,
    pub shift_matrix: CscView<'a>,
    pub tspan: &'a [f64],
    pub ldata: &'a [f64],
    pub gdata: &'a [f64],
    pub events: EventTable<'a>,
    pub n_threads: usize,
    pub seed: Option<u64>,
}

#[derive(Clone, Copy, Debug)]
struct Partition {
    start: usize,
    len: usize,
}

#[derive(Debug)]
struct PartitionPlan {
    parts: Vec<Partition>,
    block: usize,
    n_nodes: usize,
}

impl PartitionPlan {
    fn new(n_nodes: usize, n_workers: usize) -> Self {
        let block = n_nodes / n_workers;
        let mut parts = Vec::with_capacity(n_workers);
        for i in 0..n_workers {
            let start = i * block;
            let len = if i == n_workers - 1 {
                n_nodes - start
            } else {
                block
            };
            parts.push(Partition { start, len });
        }
        Self {
            parts,
            block,
            n_nodes,
        }
    }

    fn owner(&self, node: usize) -> usize {
        (node / self.block).min(self.parts.len() - 1)
    }
}

fn sample_compartments(
    select_matrix: &CscView<'_>,
    select: usize,
    counts: &[i32],
    requested: i32,
    proportion: f64,
    node: usize,
    picked: &mut [i32],
    rng: &mut Mt64,
) -> Result<(), Error> {
    picked.fill(0);
    let rows = select_matrix.col_rows(select);
    let total: i32 = rows.iter().map(|&c| counts[c]).sum();
    // A positive proportion takes precedence over the verbatim count.
    let n = if proportion > 0.0 {
        (proportion * f64::from(total)).round() as i32
    } else {
        requested
    };
    if n > total {
        return Err(Error::NegativeState { node });
    }
    if n <= 0 {
        return Ok(());
    }
    if rows.len() == 1 {
        picked[rows[0]] = n;
        return Ok(());
    }
    if n == total {
        for &c in rows {
            picked[c] = counts[c];
        }
        return Ok(());
    }

    if n > total / 2 {
        // Keep the whole selection and discard the complement.
        for &c in rows {
            picked[c] = counts[c];
        }
        let mut pool = total;
        for _ in 0..total - n {
            let mut k = rng.gen_range(0..pool);
            for &c in rows {
                if k < picked[c] {
                    picked[c] -= 1;
                    break;
                }
                k -= picked[c];
            }
            pool -= 1;
        }
    } else {
        let mut pool = total;
        for _ in 0..n {
            let mut k = rng.gen_range(0..pool);
            for &c in rows {
                let avail = counts[c] - picked[c];
                if k < avail {
                    picked[c] += 1;
                    break;
                }
                k -= avail;
            }
            pool -= 1;
        }
    }
    debug_assert_eq!(picked.iter().sum::<i32>(), n);
    Ok(())
}

#[inline]
fn shifted_target(compartment: usize, shift_matrix: &CscView<'_>, shift: i32) -> usize {
    if shift < 0 {
        compartment
    } else {
        (compartment as i64 + i64::from(shift_matrix.value_at(compartment, shift as usize)))
            as usize
    }
}

struct SimContext<'a, M: Model> {
    model: &'a M,
    dep_graph: CscView<'a>,
    state_change: CscView<'a>,
    select_matrix: CscView<'a>,
    shift_matrix: CscView<'a>,
    ldata: &'a [f64],
    gdata: &'a [f64],
    n_compartments: usize,
    n_transitions: usize,
    n_continuous: usize,
    n_ldata: usize,
}

impl<M: Model> SimContext<'_, M> {
    fn ldata_of(&self, node: usize) -> &[f64] {
        &self.ldata[node * self.n_ldata..(node + 1) * self.n_ldata]
    }
}

struct Worker {
    part: Partition,
    counts: Vec<i32>,
    aux: Vec<f64>,
    aux_next: Vec<f64>,
    rates: Vec<f64>,
    rate_sums: Vec<f64>,
    local_time: Vec<f64>,
    needs_refresh: Vec<bool>,
    queue: EventQueue,
    picked: Vec<i32>,
    error: Option<Error>,
}

impl Worker {
    fn init_rates<M: Model>(&mut self, ctx: &SimContext<'_, M>, day: f64) {
        let nc = ctx.n_compartments;
        let nt = ctx.n_transitions;
        let nd = ctx.n_continuous;
        for local in 0..self.part.len {
            let node = self.part.start + local;
            let ld = ctx.ldata_of(node);
            let mut sum = 0.0;
            for j in 0..nt {
                let rate = ctx.model.rate(
                    j,
                    &self.counts[local * nc..(local + 1) * nc],
                    &self.aux[local * nd..(local + 1) * nd],
                    ld,
                    ctx.gdata,
                    day,
                );
                self.rates[local * nt + j] = rate;
                sum += rate;
                if !rate.is_finite() || rate < 0.0 {
                    self.error
                        .get_or_insert(Error::InvalidRate { node, transition: j });
                }
            }
            self.rate_sums[local] = sum;
            self.local_time[local] = day;
        }
    }

    fn ssa<M: Model>(&mut self, ctx: &SimContext<'_, M>, rng: &mut Mt64, next_day: f64) {
        let nc = ctx.n_compartments;
        let nt = ctx.n_transitions;
        let nd = ctx.n_continuous;
        for local in 0..self.part.len {
            if self.error.is_some() {
                break;
            }
            let node = self.part.start + local;
            let base = local * nc;
            loop {
                if self.rate_sums[local] <= 0.0 {
                    self.local_time[local] = next_day;
                    break;
                }
                let tau = -uniform_pos(rng).ln() / self.rate_sums[local];
                if self.local_time[local] + tau >= next_day {
                    self.local_time[local] = next_day;
                    break;
                }
                self.local_time[local] += tau;

                let r = uniform_pos(rng) * self.rate_sums[local];
                let rates = &self.rates[local * nt..(local + 1) * nt];
                // stopping at the last slot doubles as the rounding clamp
                let mut tr = 0;
                let mut cum = rates[0];
                while tr + 1 < nt && r > cum {
                    tr += 1;
                    cum += rates[tr];
                }
                if rates[tr] == 0.0 {
                    // Walk back to the nearest transition that can fire.
                    while tr > 0 && rates[tr] == 0.0 {
                        tr -= 1;
                    }
                    if rates[tr] == 0.0 {
                        // only rounding residue left, treat as a null event
                        self.rate_sums[local] = 0.0;
                        break;
                    }
                }

                for (row, delta) in ctx.state_change.col(tr) {
                    self.counts[base + row] += delta;
                    if self.counts[base + row] < 0 {
                        self.error.get_or_insert(Error::NegativeState { node });
                    }
                }
                if self.error.is_some() {
                    break;
                }

                let ld = ctx.ldata_of(node);
                let t = self.local_time[local];
                let mut delta_sum = 0.0;
                for &dep in ctx.dep_graph.col_rows(tr) {
                    let old = self.rates[local * nt + dep];
                    let rate = ctx.model.rate(
                        dep,
                        &self.counts[base..base + nc],
                        &self.aux[local * nd..(local + 1) * nd],
                        ld,
                        ctx.gdata,
                        t,
                    );
                    if !rate.is_finite() || rate < 0.0 {
                        self.error
                            .get_or_insert(Error::InvalidRate { node, transition: dep });
                    }
                    self.rates[local * nt + dep] = rate;
                    delta_sum += rate - old;
                }
                self.rate_sums[local] += delta_sum;
                if self.error.is_some() {
                    break;
                }
            }
        }
    }

    fn process_intra_events<M: Model>(
        &mut self,
        ctx: &SimContext<'_, M>,
        rng: &mut Mt64,
        day: f64,
    ) {
        let nc = ctx.n_compartments;
        while self.error.is_none() {
            let Some(ev) = self.queue.next_due(day) else {
                break;
            };
            let local = ev.node - self.part.start;
            let base = local * nc;
            match ev.kind {
                EventKind::Enter => {
                    // individuals enter the first compartment of the select column
                    let row = ctx.select_matrix.col_rows(ev.select)[0];
                    self.counts[base + row] += ev.n;
                }
                EventKind::Exit => {
                    let sampled = sample_compartments(
                        &ctx.select_matrix,
                        ev.select,
                        &self.counts[base..base + nc],
                        ev.n,
                        ev.proportion,
                        ev.node,
                        &mut self.picked,
                        rng,
                    );
                    if let Err(err) = sampled {
                        self.error = Some(err);
                        break;
                    }
                    for &c in ctx.select_matrix.col_rows(ev.select) {
                        self.counts[base + c] -= self.picked[c];
                        if self.counts[base + c] < 0 {
                            self.error
                                .get_or_insert(Error::NegativeState { node: ev.node });
                        }
                    }
                }
                EventKind::InternalTransfer => {
                    let sampled = sample_compartments(
                        &ctx.select_matrix,
                        ev.select,
                        &self.counts[base..base + nc],
                        ev.n,
                        ev.proportion,
                        ev.node,
                        &mut self.picked,
                        rng,
                    );
                    if let Err(err) = sampled {
                        self.error = Some(err);
                        break;
                    }
                    for &c in ctx.select_matrix.col_rows(ev.select) {
                        let moved = self.picked[c];
                        if moved == 0 {
                            continue;
                        }
                        let target = shifted_target(c, &ctx.shift_matrix, ev.shift);
                        self.counts[base + target] += moved;
                        self.counts[base + c] -= moved;
                        if self.counts[base + c] < 0 {
                            self.error
                                .get_or_insert(Error::NegativeState { node: ev.node });
                        }
                    }
                }
                EventKind::ExternalTransfer => {
                    unreachable!("inter-node events never reach a worker queue")
                }
            }
            if self.error.is_some() {
                break;
            }
            self.needs_refresh[local] = true;
            self.queue.advance();
        }
    }

    fn post_day<M: Model>(&mut self, ctx: &SimContext<'_, M>, day: f64) {
        let nc = ctx.n_compartments;
        let nt = ctx.n_transitions;
        let nd = ctx.n_continuous;
        for local in 0..self.part.len {
            if self.error.is_some() {
                break;
            }
            let node = self.part.start + local;
            let ld = ctx.ldata_of(node);
            let code = ctx.model.post_step(
                &mut self.aux_next[local * nd..(local + 1) * nd],
                &self.counts[local * nc..(local + 1) * nc],
                &self.aux[local * nd..(local + 1) * nd],
                ld,
                ctx.gdata,
                node,
                day,
            );
            let refresh = match code {
                PostStep::Error(status) => {
                    self.error.get_or_insert(Error::PostStep { node, status });
                    break;
                }
                PostStep::Update => true,
                PostStep::NoUpdate => self.needs_refresh[local],
            };
            if refresh {
                // refreshed rates must see the state the next day starts from
                let mut delta_sum = 0.0;
                for j in 0..nt {
                    let old = self.rates[local * nt + j];
                    let rate = ctx.model.rate(
                        j,
                        &self.counts[local * nc..(local + 1) * nc],
                        &self.aux_next[local * nd..(local + 1) * nd],
                        ld,
                        ctx.gdata,
                        day,
                    );
                    if !rate.is_finite() || rate < 0.0 {
                        self.error
                            .get_or_insert(Error::InvalidRate { node, transition: j });
                    }
                    self.rates[local * nt + j] = rate;
                    delta_sum += rate - old;
                }
                self.rate_sums[local] += delta_sum;
                self.needs_refresh[local] = false;
            }
        }
    }
}

struct Solver<'a, 'o, M: Model> {
    ctx: SimContext<'a, M>,
    plan: PartitionPlan,
    workers: Vec<Worker>,
    rngs: Vec<Mt64>,
    pool: rayon::ThreadPool,
    inter_events: EventQueue,
    inter_picked: Vec<i32>,
    tspan: &'a [f64],
    day: f64,
    next_day: f64,
    u_out: StateOutput<'o, i32>,
    v_out: StateOutput<'o, f64>,
    u_cursor: usize,
    v_cursor: usize,
}

impl<M: Model> Solver<'_, '_, M> {
    fn run(&mut self) -> Result<(), Error> {
        {
            let ctx = &self.ctx;
            let workers = &mut self.workers;
            let day = self.day;
            self.pool
                .install(|| workers.par_iter_mut().for_each(|w| w.init_rates(ctx, day)));
        }
        self.check_errors()?;

        let tlen = self.tspan.len();
        while self.u_cursor < tlen || self.v_cursor < tlen {
            {
                let ctx = &self.ctx;
                let workers = &mut self.workers;
                let rngs = &mut self.rngs;
                let day = self.day;
                let next_day = self.next_day;
                self.pool.install(|| {
                    workers
                        .par_iter_mut()
                        .zip(rngs.par_iter_mut())
                        .for_each(|(w, rng)| {
                            w.ssa(ctx, rng, next_day);
                            w.process_intra_events(ctx, rng, day);
                        })
                });
            }
            self.check_errors()?;

            // Single worker, all others held at the barrier, so cross-partition
            // access is race-free.
            self.process_inter_events();
            self.check_errors()?;

            {
                let ctx = &self.ctx;
                let workers = &mut self.workers;
                let day = self.day;
                self.pool
                    .install(|| workers.par_iter_mut().for_each(|w| w.post_day(ctx, day)));
            }

            self.day = self.next_day;
            self.next_day += 1.0;

            self.store_samples();

            for w in &mut self.workers {
                std::mem::swap(&mut w.aux, &mut w.aux_next);
            }
            self.check_errors()?;
        }
        Ok(())
    }

    fn check_errors(&self) -> Result<(), Error> {
        for w in &self.workers {
            if let Some(err) = &w.error {
                return Err(err.clone());
            }
        }
        Ok(())
    }

    fn process_inter_events(&mut self) {
        if self.inter_events.events.is_empty() {
            return;
        }
        let nc = self.ctx.n_compartments;
        let day = self.day;
        // Inter-node sampling draws from worker 0's stream.
        let mut rng = self.rngs[0].clone();
        loop {
            let Some(ev) = self.inter_events.next_due(day) else {
                break;
            };
            let src_worker = self.plan.owner(ev.node);
            let dst_worker = self.plan.owner(ev.dest);
            let src_base = (ev.node - self.workers[src_worker].part.start) * nc;
            let dst_base = (ev.dest - self.workers[dst_worker].part.start) * nc;

            let sampled = sample_compartments(
                &self.ctx.select_matrix,
                ev.select,
                &self.workers[src_worker].counts[src_base..src_base + nc],
                ev.n,
                ev.proportion,
                ev.node,
                &mut self.inter_picked,
                &mut rng,
            );
            if let Err(err) = sampled {
                self.workers[0].error.get_or_insert(err);
                break;
            }

            let mut negative = false;
            for &c in self.ctx.select_matrix.col_rows(ev.select) {
                let moved = self.inter_picked[c];
                if moved == 0 {
                    continue;
                }
                let w = &mut self.workers[src_worker];
                w.counts[src_base + c] -= moved;
                if w.counts[src_base + c] < 0 {
                    negative = true;
                }
            }
            if negative {
                self.workers[0]
                    .error
                    .get_or_insert(Error::NegativeState { node: ev.node });
                break;
            }
            for &c in self.ctx.select_matrix.col_rows(ev.select) {
                let moved = self.inter_picked[c];
                if moved == 0 {
                    continue;
                }
                let target = shifted_target(c, &self.ctx.shift_matrix, ev.shift);
                self.workers[dst_worker].counts[dst_base + target] += moved;
            }

            let src_local = ev.node - self.workers[src_worker].part.start;
            let dst_local = ev.dest - self.workers[dst_worker].part.start;
            self.workers[src_worker].needs_refresh[src_local] = true;
            self.workers[dst_worker].needs_refresh[dst_local] = true;
            self.inter_events.advance();
        }
        self.rngs[0] = rng;
    }

    fn store_samples(&mut self) {
        let tlen = self.tspan.len();
        let nc = self.ctx.n_compartments;
        let nd = self.ctx.n_continuous;
        let n_nodes = self.plan.n_nodes;

        // Strictly past the sample time, so the initial column written at
        // setup is never touched again.
        match &mut self.u_out {
            StateOutput::Dense(out) => {
                let stride = n_nodes * nc;
                while self.u_cursor < tlen && self.day > self.tspan[self.u_cursor] {
                    let col = &mut out[self.u_cursor * stride..(self.u_cursor + 1) * stride];
                    for w in &self.workers {
                        col[w.part.start * nc..(w.part.start + w.part.len) * nc]
                            .copy_from_slice(&w.counts);
                    }
                    self.u_cursor += 1;
                }
            }
            StateOutput::Sparse { jc, ir, pr } => {
                while self.u_cursor < tlen && self.day > self.tspan[self.u_cursor] {
                    let k = self.u_cursor;
                    for i in jc[k]..jc[k + 1] {
                        let flat = ir[i];
                        let node = flat / nc;
                        let w = &self.workers[self.plan.owner(node)];
                        pr[i] = f64::from(w.counts[(node - w.part.start) * nc + flat % nc]);
                    }
                    self.u_cursor += 1;
                }
            }
        }

        // The continuous state is recorded before the buffer swap.
        match &mut self.v_out {
            StateOutput::Dense(out) => {
                let stride = n_nodes * nd;
                while self.v_cursor < tlen && self.day > self.tspan[self.v_cursor] {
                    let col = &mut out[self.v_cursor * stride..(self.v_cursor + 1) * stride];
                    for w in &self.workers {
                        col[w.part.start * nd..(w.part.start + w.part.len) * nd]
                            .copy_from_slice(&w.aux_next);
                    }
                    self.v_cursor += 1;
                }
            }
            StateOutput::Sparse { jc, ir, pr } => {
                while self.v_cursor < tlen && self.day > self.tspan[self.v_cursor] {
                    let k = self.v_cursor;
                    for i in jc[k]..jc[k + 1] {
                        let flat = ir[i];
                        let node = flat / nd;
                        let w = &self.workers[self.plan.owner(node)];
                        pr[i] = w.aux_next[(node - w.part.start) * nd + flat % nd];
                    }
                    self.v_cursor += 1;
                }
            }
        }
    }
}

fn validate_sink<T>(
    out: &StateOutput<'_, T>,
    n_rows: usize,
    tlen: usize,
    name: &str,
) -> Result<(), Error> {
    match out {
        StateOutput::Dense(buf) => {
            if buf.len() != n_rows * tlen {
                return Err(invalid(format!(
                    "dense {name} output length {} does not match {} rows x {} columns",
                    buf.len(),
                    n_rows,
                    tlen
                )));
            }
        }
        StateOutput::Sparse { jc, ir, pr } => {
            if jc.len() != tlen + 1 {
                return Err(invalid(format!(
                    "sparse {name} output must carry {} column pointers",
                    tlen + 1
                )));
            }
            if jc[0] != 0 || jc.windows(2).any(|w| w[1] < w[0]) {
                return Err(invalid(format!(
                    "sparse {name} column pointers must start at 0 and be non-decreasing"
                )));
            }
            if jc[tlen] != ir.len() || pr.len() != ir.len() {
                return Err(invalid(format!(
                    "sparse {name} output storage does not match its column pointers"
                )));
            }
            if ir.iter().any(|&r| r >= n_rows) {
                return Err(invalid(format!(
                    "sparse {name} output row index exceeds {n_rows} rows"
                )));
            }
        }
    }
    Ok(())
}

fn write_initial_column<T: Copy + Into<f64>>(out: &mut StateOutput<'_, T>, init: &[T]) {
    match out {
        StateOutput::Dense(buf) => buf[..init.len()].copy_from_slice(init),
        StateOutput::Sparse { jc, ir, pr } => {
            for i in jc[0]..jc[1] {
                pr[i] = init[ir[i]].into();
            }
        }
    }
}

pub fn simulate<M: Model>(
    model: &M,
    args: SolverArgs<'_>,
    mut output: SolverOutput<'_>,
) -> Result<(), Error> {
    let nc = args.state_change.nrow();
    let nt = args.state_change.ncol();
    if nc == 0 || nt == 0 {
        return Err(invalid(
            "the state-change matrix must contain at least one compartment and one transition",
        ));
    }
    if args.u0.is_empty() || args.u0.len() % nc != 0 {
        return Err(invalid(format!(
            "initial state length {} is not a non-empty multiple of {} compartments",
            args.u0.len(),
            nc
        )));
    }
    let n_nodes = args.u0.len() / nc;
    if args.u0.iter().any(|&x| x < 0) {
        return Err(invalid("initial compartment counts must be non-negative"));
    }
    if args.v0.len() % n_nodes != 0 {
        return Err(invalid(format!(
            "continuous state length {} is not a multiple of {} nodes",
            args.v0.len(),
            n_nodes
        )));
    }
    let nd = args.v0.len() / n_nodes;
    if args.ldata.len() % n_nodes != 0 {
        return Err(invalid(format!(
            "local data length {} is not a multiple of {} nodes",
            args.ldata.len(),
            n_nodes
        )));
    }
    let nld = args.ldata.len() / n_nodes;
    if args.dep_graph.nrow() != nt || args.dep_graph.ncol() != nt {
        return Err(invalid(
            "the dependency graph must be square over the transitions",
        ));
    }
    if args.select_matrix.nrow() != nc {
        return Err(invalid(
            "the selection matrix must have one row per compartment",
        ));
    }
    if args.shift_matrix.nrow() != nc {
        return Err(invalid("the shift matrix must have one row per compartment"));
    }
    if args.tspan.is_empty() {
        return Err(invalid("tspan must contain at least one sample time"));
    }
    if args.tspan.iter().any(|t| !t.is_finite()) {
        return Err(invalid("tspan must be finite"));
    }
    if args.tspan.windows(2).any(|w| w[1] <= w[0]) {
        return Err(invalid("tspan must be strictly increasing"));
    }
    let tlen = args.tspan.len();
    validate_sink(&output.u, n_nodes * nc, tlen, "compartment")?;
    validate_sink(&output.v, n_nodes * nd, tlen, "continuous")?;

    let n_workers = effective_thread_count(args.n_threads, n_nodes);
    let plan = PartitionPlan::new(n_nodes, n_workers);

    let (intra, inter) = split_events(
        &args.events,
        n_nodes,
        &args.select_matrix,
        &args.shift_matrix,
        &plan,
    )?;

    // The master generator only derives the per-worker streams.
    let mut master = Mt64::new(args.seed.unwrap_or_else(wall_clock_seed));
    let rngs: Vec<Mt64> = (0..n_workers).map(|_| Mt64::new(master.gen())).collect();

    let mut workers = Vec::with_capacity(n_workers);
    for (part, queue) in plan.parts.iter().zip(intra) {
        let clo = part.start * nc;
        let chi = (part.start + part.len) * nc;
        let dlo = part.start * nd;
        let dhi = (part.start + part.len) * nd;
        workers.push(Worker {
            part: *part,
            counts: args.u0[clo..chi].to_vec(),
            aux: args.v0[dlo..dhi].to_vec(),
            aux_next: args.v0[dlo..dhi].to_vec(),
            rates: vec![0.0; part.len * nt],
            rate_sums: vec![0.0; part.len],
            local_time: vec![0.0; part.len],
            needs_refresh: vec![false; part.len],
            queue,
            picked: vec![0; nc],
            error: None,
        });
    }

    write_initial_column(&mut output.u, args.u0);
    write_initial_column(&mut output.v, args.v0);

    let pool = ThreadPoolBuilder::new()
        .num_threads(n_workers)
        .build()
        .map_err(|e| invalid(format!("thread pool: {e}")))?;

    let day = args.tspan[0];
    let mut solver = Solver {
        ctx: SimContext {
            model,
            dep_graph: args.dep_graph,
            state_change: args.state_change,
            select_matrix: args.select_matrix,
            shift_matrix: args.shift_matrix,
            ldata: args.ldata,
            gdata: args.gdata,
            n_compartments: nc,
            n_transitions: nt,
            n_continuous: nd,
            n_ldata: nld,
        },
        plan,
        workers,
        rngs,
        pool,
        inter_events: inter,
        inter_picked: vec![0; nc],
        tspan: args.tspan,
        day,
        next_day: day.floor() + 1.0,
        u_out: output.u,
        v_out: output.v,
        u_cursor: 1,
        v_cursor: 1,
    };
    solver.run()
}

// Susceptible-infected-susceptible dynamics coupled to an environmental
// infectious-pressure variable phi; gdata carries
// [upsilon, gamma, alpha, beta_t1..beta_t4, epsilon].
pub struct Sise;

impl Sise {
    pub const S: usize = 0;
    pub const I: usize = 1;
    pub const PHI: usize = 0;

    pub const UPSILON: usize = 0;
    pub const GAMMA: usize = 1;
    pub const ALPHA: usize = 2;
    pub const BETA_T1: usize = 3;
    pub const BETA_T2: usize = 4;
    pub const BETA_T3: usize = 5;
    pub const BETA_T4: usize = 6;
    pub const EPSILON: usize = 7;

    const DAYS_IN_YEAR: i64 = 365;
    const DAYS_IN_QUARTER: i64 = 91;
}

impl Model for Sise {
    fn rate(
        &self,
        transition: usize,
        u: &[i32],
        v: &[f64],
        _ldata: &[f64],
        gdata: &[f64],
        _t: f64,
    ) -> f64 {
        match transition {
            // susceptible to infected, driven by the environmental pressure
            0 => gdata[Self::UPSILON] * v[Self::PHI] * f64::from(u[Self::S]),
            // infected back to susceptible
            _ => gdata[Self::GAMMA] * f64::from(u[Self::I]),
        }
    }

    fn post_step(
        &self,
        v_new: &mut [f64],
        u: &[i32],
        v: &[f64],
        _ldata: &[f64],
        gdata: &[f64],
        _node: usize,
        t: f64,
    ) -> PostStep {
        let s = f64::from(u[Self::S]);
        let i = f64::from(u[Self::I]);
        // Quarterly decay of the environmental pressure, forward Euler.
        let beta = match ((t as i64).rem_euclid(Self::DAYS_IN_YEAR)) / Self::DAYS_IN_QUARTER {
            0 => gdata[Self::BETA_T1],
            1 => gdata[Self::BETA_T2],
            2 => gdata[Self::BETA_T3],
            _ => gdata[Self::BETA_T4],
        };
        let mut phi = v[Self::PHI] * (1.0 - beta);
        if s + i > 0.0 {
            phi += gdata[Self::ALPHA] * i / (s + i) + gdata[Self::EPSILON];
        } else {
            phi += gdata[Self::EPSILON];
        }
        v_new[Self::PHI] = phi;
        if phi == v[Self::PHI] {
            PostStep::NoUpdate
        } else {
            PostStep::Update
        }
    }
}

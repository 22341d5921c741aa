use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::label_queue::{LabelStop, LabelStopQueue};
use crate::trace::TraceContext;
use crate::SearchParams;

/// Sentinel cost for unreachable / walk-only aggregates.
pub const MAX_COST: f64 = 999_999.0;


/// The kind of link a state departs by (outbound) or arrives by (inbound).
/// Also used to tag demand mode types in the weight table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DepArrMode {
    Access,
    Egress,
    Transfer,
    Transit,
}

impl DepArrMode {
    pub fn to_int(self) -> i32 {
        match self {
            DepArrMode::Access => 0,
            DepArrMode::Egress => 1,
            DepArrMode::Transfer => 2,
            DepArrMode::Transit => 3,
        }
    }

    pub fn is_trip(self) -> bool {
        return self == DepArrMode::Transit;
    }
}

impl fmt::Display for DepArrMode {
    fn fmt(&self, ff: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DepArrMode::Access => "Access",
            DepArrMode::Egress => "Egress",
            DepArrMode::Transfer => "Transfer",
            DepArrMode::Transit => "Transit",
        };
        write!(ff, "{}", name)
    }
}

impl FromStr for DepArrMode {
    type Err = String;

    fn from_str(ss: &str) -> Result<DepArrMode, String> {
        match ss {
            "access" => Ok(DepArrMode::Access),
            "egress" => Ok(DepArrMode::Egress),
            "transfer" => Ok(DepArrMode::Transfer),
            "transit" => Ok(DepArrMode::Transit),
            other => Err(format!("unknown demand mode type [{}]", other)),
        }
    }
}


/// One candidate labeled link at a stop.
///
/// Outbound searches run backwards from the destination, so `deparr_time` is a
/// departure and `stop_succpred` a successor; inbound searches run forwards and
/// the same fields hold an arrival and a predecessor.  For transit links
/// `trip_id` is the trip; for access/egress it encodes the supply mode.
#[derive(Clone, Copy, Debug)]
pub struct StopState {
    pub deparr_time: f64,
    pub deparr_mode: DepArrMode,
    pub trip_id: i32,
    pub stop_succpred: i32,
    pub seq: i32,
    pub seq_succpred: i32,
    pub link_time: f64,
    pub link_cost: f64,
    pub cost: f64,
    pub iteration: i32,
    pub arrdep_time: f64,
}

// Value-tuple ordering so paths can be de-duplicated in ordered maps.
impl Ord for StopState {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deparr_time.total_cmp(&other.deparr_time)
            .then_with(|| self.deparr_mode.cmp(&other.deparr_mode))
            .then_with(|| self.trip_id.cmp(&other.trip_id))
            .then_with(|| self.stop_succpred.cmp(&other.stop_succpred))
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| self.seq_succpred.cmp(&other.seq_succpred))
            .then_with(|| self.link_time.total_cmp(&other.link_time))
            .then_with(|| self.link_cost.total_cmp(&other.link_cost))
            .then_with(|| self.cost.total_cmp(&other.cost))
            .then_with(|| self.iteration.cmp(&other.iteration))
            .then_with(|| self.arrdep_time.total_cmp(&other.arrdep_time))
    }
}

impl PartialOrd for StopState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        return Some(self.cmp(other));
    }
}

impl PartialEq for StopState {
    fn eq(&self, other: &Self) -> bool {
        return self.cmp(other) == Ordering::Equal;
    }
}

impl Eq for StopState {}


/// Per-stop aggregate kept only in hyperpath mode.
#[derive(Clone, Copy, Debug)]
pub struct HyperpathState {
    /// Latest departure (outbound) or earliest arrival (inbound) among the
    /// stop's kept states; defines the admissible time window.
    pub latest_dep_earliest_arr: f64,
    /// The trip whose link set the window envelope.
    pub lder_trip_id: i32,
    /// Soft-max cost over the stop's kept states.
    pub hyperpath_cost: f64,
    pub process_count: i32,
}

/// An ordered list of (stop id, state) pairs in search order.
pub type Path = Vec<(i32, StopState)>;

#[derive(Clone, Copy, Debug, Default)]
pub struct PathInfo {
    /// Number of times this path was sampled.
    pub count: i32,
    /// Generalized cost after reconciliation.
    pub cost: f64,
    /// Fraction of the sampled set, by soft-max over reconciled costs.
    pub probability: f64,
    /// Cumulative integerized probability used for the final discrete draw.
    pub prob_i: i64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PerformanceInfo {
    pub label_iterations: i32,
    pub max_process_count: i32,
    pub milliseconds_labeling: i64,
    pub milliseconds_enumerating: i64,
}


/// The per-call store of candidate states, with the hyperpath aggregates
/// alongside.  Constructed fresh for each search and discarded at return.
pub struct StopStates {
    states: HashMap<i32, Vec<StopState>>,
    hyperpath: HashMap<i32, HyperpathState>,
}

impl StopStates {
    pub fn new() -> StopStates {
        return StopStates {
            states: HashMap::new(),
            hyperpath: HashMap::new(),
        };
    }

    pub fn states(&self, stop_id: i32) -> &[StopState] {
        match self.states.get(&stop_id) {
            Some(states) => states.as_slice(),
            None => &[],
        }
    }

    pub fn first_mode(&self, stop_id: i32) -> Option<DepArrMode> {
        self.states.get(&stop_id)
            .and_then(|states| states.first())
            .map(|ss| ss.deparr_mode)
    }

    pub fn hyperpath_state(&self, stop_id: i32) -> Option<&HyperpathState> {
        self.hyperpath.get(&stop_id)
    }

    pub fn hyperpath_cost(&self, stop_id: i32) -> f64 {
        match self.hyperpath.get(&stop_id) {
            Some(hss) => hss.hyperpath_cost,
            None => MAX_COST,
        }
    }

    pub fn latest_dep_earliest_arr(&self, stop_id: i32) -> Option<f64> {
        self.hyperpath.get(&stop_id).map(|hss| hss.latest_dep_earliest_arr)
    }

    pub fn process_count(&self, stop_id: i32) -> i32 {
        match self.hyperpath.get(&stop_id) {
            Some(hss) => hss.process_count,
            None => 0,
        }
    }

    /// Mark the stop as being processed once more; returns the new count.
    pub fn bump_process_count(&mut self, stop_id: i32) -> i32 {
        let hss = match self.hyperpath.get_mut(&stop_id) {
            Some(hss) => hss,
            None => return 0,
        };
        hss.process_count += 1;
        return hss.process_count;
    }

    /// Soft-max cost over the transit states only.  Returns `MAX_COST` when the
    /// stop has no transit state yet, i.e. it is reachable only by walking.
    pub fn nonwalk_label(states: &[StopState], dispersion: f64) -> f64 {
        let mut sum = 0.0;
        for ss in states {
            if ss.deparr_mode == DepArrMode::Transit {
                sum += (-dispersion * ss.cost).exp();
            }
        }
        if sum == 0.0 {
            return MAX_COST;
        }
        return -(1.0 / dispersion) * sum.ln();
    }

    /// The relaxation primitive: offer a candidate state to a stop, updating the
    /// stop's label in the queue when the offer improves things.
    ///
    /// Deterministic searches keep at most one state per stop, replaced only by
    /// a strictly cheaper candidate.  Hyperpath searches keep every candidate
    /// inside the stop's time window, merge duplicates in place, prune states
    /// the (possibly moved) window no longer admits, and maintain the soft-max
    /// cost over what remains.
    pub fn add_stop_state(&mut self, hyperpath: bool, outbound: bool, params: &SearchParams,
                          stop_id: i32, ss: StopState, queue: &mut LabelStopQueue,
                          trace: &mut TraceContext) {
        let mut rejected = false;
        let mut trace_suffix = "";
        let mut hp_cost_change: Option<(f64, f64)> = None;

        if !hyperpath {
            let states = self.states.entry(stop_id).or_insert_with(Vec::new);
            if states.is_empty() {
                states.push(ss);
                queue.push(LabelStop { label: ss.cost, stop_id });
                trace_suffix = " (new)";
            } else if ss.cost < states[0].cost {
                states[0] = ss;
                queue.push(LabelStop { label: ss.cost, stop_id });
                trace_suffix = " (update)";
            } else {
                rejected = true;
                trace_suffix = " (rejected)";
            }
        } else if !self.hyperpath.contains_key(&stop_id) {
            self.hyperpath.insert(stop_id, HyperpathState {
                latest_dep_earliest_arr: ss.deparr_time,
                lder_trip_id: ss.trip_id,
                hyperpath_cost: ss.cost,
                process_count: 0,
            });
            self.states.entry(stop_id).or_insert_with(Vec::new).push(ss);
            queue.push(LabelStop { label: ss.cost, stop_id });
            trace_suffix = " (new)";
        } else {
            let hss = self.hyperpath.get_mut(&stop_id).unwrap();
            let mut label = ss.cost;
            // did the label or time window change?  if so the stop needs
            // reprocessing, so it goes back on the queue
            let mut update_state = false;

            // too early (outbound) or too late (inbound)?
            if (outbound && ss.deparr_time < hss.latest_dep_earliest_arr - params.time_window) ||
               (!outbound && ss.deparr_time > hss.latest_dep_earliest_arr + params.time_window) {
                rejected = true;
                trace_suffix = " (rejected)";
            }

            // a later departure (outbound) or earlier arrival (inbound) moves
            // the window envelope
            if (outbound && ss.deparr_time > hss.latest_dep_earliest_arr) ||
               (!outbound && ss.deparr_time < hss.latest_dep_earliest_arr) {
                hss.latest_dep_earliest_arr = ss.deparr_time;
                hss.lder_trip_id = ss.trip_id;
                update_state = true;
                label = hss.hyperpath_cost;
                trace_suffix = " (window)";
            }

            if !rejected {
                let window_center = hss.latest_dep_earliest_arr;
                let states = self.states.entry(stop_id).or_insert_with(Vec::new);

                // a state for the same alternative is overwritten in place
                let mut state_found = false;
                for existing in states.iter_mut() {
                    if existing.deparr_mode == ss.deparr_mode &&
                       existing.trip_id == ss.trip_id &&
                       existing.stop_succpred == ss.stop_succpred &&
                       existing.seq_succpred == ss.seq_succpred {
                        *existing = ss;
                        state_found = true;
                    }
                }

                // prune states the moved window no longer admits
                states.retain(|existing| {
                    !((outbound && existing.deparr_time < window_center - params.time_window) ||
                      (!outbound && existing.deparr_time > window_center + params.time_window))
                });

                if !state_found {
                    states.push(ss);
                }

                let mut sum = 0.0;
                for existing in states.iter() {
                    sum += (-params.stoch_dispersion * existing.cost).exp();
                }
                let hyperpath_cost = -(1.0 / params.stoch_dispersion) * sum.ln();
                if (hyperpath_cost - hss.hyperpath_cost).abs() > 1e-4 {
                    hp_cost_change = Some((hss.hyperpath_cost, hyperpath_cost));
                    update_state = true;
                    hss.hyperpath_cost = hyperpath_cost;
                    label = hyperpath_cost;
                }

                if update_state {
                    queue.push(LabelStop { label, stop_id });
                }
            }
        }

        if trace.enabled() {
            let mut line = format!("  + new {}{}", trace.stop_state_line(stop_id, &ss),
                                   trace_suffix);
            if let Some((old, new)) = hp_cost_change {
                line.push_str(&format!(" (hp cost {:.4}->{:.4})", old, new));
            }
            trace.note(&line);
            if !rejected {
                trace.accepted_label(stop_id, &ss);
            }
        }
    }
}

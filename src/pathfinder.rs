use std::collections::{BTreeMap, HashMap};
use std::path::{Path as FsPath, PathBuf};
use std::time::Instant;

use ndarray::prelude::*;
use rand::Rng;
use rand::SeedableRng;
use rand_isaac::Isaac64Rng;

use crate::label_queue::{LabelStop, LabelStopQueue};
use crate::path_states::{
    DepArrMode, Path, PathInfo, PerformanceInfo, StopState, StopStates, MAX_COST,
};
use crate::supply::{Attributes, Supply, TripStop, UserClassMode};
use crate::trace::{format_time, TraceContext};
use crate::{PathfinderError, SearchParams};


/// Integer scale applied to probabilities for the discrete sampling draws.
/// Candidates whose scaled probability rounds below 1 are dropped.
pub const PROBABILITY_SCALE: i64 = i32::MAX as i64;

const PROBABILITY_CUTOFF: i64 = 1;

/// One demand's pathfinding request.
#[derive(Clone, Debug)]
pub struct PathSpecification {
    pub iteration: i32,
    pub passenger_id: i32,
    pub path_id: i32,
    pub hyperpath: bool,
    pub user_class: String,
    pub access_mode: String,
    pub transit_mode: String,
    pub egress_mode: String,
    pub origin_taz_id: i32,
    pub destination_taz_id: i32,
    pub outbound: bool,
    pub preferred_time: f64,
    pub trace: bool,
}

/// The outcome of one `find_path` call.  An empty path means no path was found;
/// the performance counters are filled either way.
pub struct FoundPath {
    /// The chosen path in search order (origin-first when outbound).
    pub states: Path,
    /// Path as a [K x 6] matrix: stop, mode, trip, successor/predecessor stop,
    /// sequence, successor/predecessor sequence.
    pub path_int: Array2<i32>,
    /// Path as a [K x 5] matrix: reserved label, departure/arrival time, link
    /// time, link cost, arrival/departure time.
    pub path_real: Array2<f64>,
    pub total_cost: f64,
    pub path_info: PathInfo,
    pub perf: PerformanceInfo,
}

impl FoundPath {
    pub fn path_found(&self) -> bool {
        return !self.states.is_empty();
    }
}

// cumulative sampling record for one candidate state
struct ProbabilityStop {
    probability: f64,
    prob_i: i64,
    index: usize,
}


/// The pathfinding engine.  Holds the immutable supply and parameters; each
/// `find_path` call owns its own stop states, queue, and random stream, so a
/// finder behind a shared reference may serve calls from many threads at once.
pub struct PathFinder {
    params: SearchParams,
    supply: Supply,
    bump_wait: HashMap<TripStop, f64>,
    output_dir: PathBuf,
}

impl PathFinder {
    pub fn new(params: SearchParams, supply: Supply, output_dir: &FsPath) -> PathFinder {
        return PathFinder {
            params,
            supply,
            bump_wait: HashMap::new(),
            output_dir: PathBuf::from(output_dir),
        };
    }

    pub fn supply(&self) -> &Supply {
        return &self.supply;
    }

    /// Replace the bump-wait map from a prior iteration's capacity accounting:
    /// an [N x 3] (trip, sequence, stop) index and an [N] array of bump times.
    pub fn set_bump_wait(&mut self, index: ArrayView2<i32>, times: ArrayView1<f64>)
                         -> Result<(), PathfinderError> {
        if index.ncols() != 3 {
            return Err(PathfinderError::BadArrayShape {
                name: "bump wait index columns", expected: 3, got: index.ncols() });
        }
        if index.nrows() != times.len() {
            return Err(PathfinderError::BadArrayShape {
                name: "bump wait rows", expected: index.nrows(), got: times.len() });
        }
        self.bump_wait.clear();
        for ii in 0..index.nrows() {
            let ts = TripStop {
                trip_id: index[[ii, 0]],
                seq: index[[ii, 1]],
                stop_id: index[[ii, 2]],
            };
            self.bump_wait.insert(ts, times[ii]);
        }
        Ok(())
    }

    /// Find a path for one demand at its preferred time.
    pub fn find_path(&self, spec: &PathSpecification) -> Result<FoundPath, PathfinderError> {
        let mut trace = TraceContext::new(&self.supply, spec, &self.output_dir)?;
        if trace.enabled() {
            trace.note(&format!("Tracing assignment of passenger {} with path id {}",
                                spec.passenger_id, spec.path_id));
            trace.note(&format!("iteration      = {}", spec.iteration));
            trace.note(&format!("outbound       = {}", spec.outbound));
            trace.note(&format!("hyperpath      = {}", spec.hyperpath));
            trace.note(&format!("preferred_time = {} ({})",
                                format_time(spec.preferred_time), spec.preferred_time));
            trace.note(&format!("user_class     = {}", spec.user_class));
            trace.note(&format!("access_mode    = {}", spec.access_mode));
            trace.note(&format!("transit_mode   = {}", spec.transit_mode));
            trace.note(&format!("egress_mode    = {}", spec.egress_mode));
            trace.note(&format!("orig_taz_id    = {}", spec.origin_taz_id));
            trace.note(&format!("dest_taz_id    = {}", spec.destination_taz_id));
        }

        let mut stop_states = StopStates::new();
        let mut queue = LabelStopQueue::new();

        let labeling_start = Instant::now();
        self.initialize_stop_states(spec, &mut trace, &mut stop_states, &mut queue)?;
        let (label_iterations, max_process_count) =
            self.label_stops(spec, &mut trace, &mut stop_states, &mut queue)?;
        self.finalize_taz_state(spec, &mut trace, &mut stop_states, &mut queue,
                                label_iterations)?;
        let milliseconds_labeling = labeling_start.elapsed().as_millis() as i64;

        let enumerating_start = Instant::now();
        let found = self.get_found_path(spec, &mut trace, &stop_states);
        let milliseconds_enumerating = enumerating_start.elapsed().as_millis() as i64;

        let perf = PerformanceInfo {
            label_iterations,
            max_process_count,
            milliseconds_labeling,
            milliseconds_enumerating,
        };
        if trace.enabled() {
            trace.note(&format!("        label iterations: {}", perf.label_iterations));
            trace.note(&format!("       max process count: {}", perf.max_process_count));
            trace.note(&format!("   milliseconds labeling: {}", perf.milliseconds_labeling));
            trace.note(&format!("milliseconds enumerating: {}", perf.milliseconds_enumerating));
        }

        let (states, path_info) = match found {
            Some((path, info)) => {
                if trace.enabled() {
                    trace.note("Final path");
                    trace.print_path(&path);
                }
                (path, info)
            }
            None => {
                if trace.enabled() {
                    trace.note("No path found");
                }
                (vec![], PathInfo::default())
            }
        };
        let (path_int, path_real) = package_path(&states);
        Ok(FoundPath {
            states,
            path_int,
            path_real,
            total_cost: path_info.cost,
            path_info,
            perf,
        })
    }

    /// Seed the stop states from the access/egress links of the search origin:
    /// the destination TAZ for outbound searches (which run backwards in time),
    /// the origin TAZ for inbound ones.
    fn initialize_stop_states(&self, spec: &PathSpecification, trace: &mut TraceContext,
                              stop_states: &mut StopStates, queue: &mut LabelStopQueue)
                              -> Result<(), PathfinderError> {
        let start_taz_id = if spec.outbound { spec.destination_taz_id } else { spec.origin_taz_id };
        let dir_factor = if spec.outbound { 1.0 } else { -1.0 };

        let taz_links = self.supply.access_links(start_taz_id)
            .ok_or(PathfinderError::NoAccessEgressLinks(start_taz_id))?;

        let link_mode = if spec.outbound { DepArrMode::Egress } else { DepArrMode::Access };
        let demand_mode = if spec.outbound { &spec.egress_mode } else { &spec.access_mode };
        let ucm = UserClassMode::new(&spec.user_class, link_mode, demand_mode);
        let mode_weights = self.supply.weights(&ucm).ok_or_else(|| {
            PathfinderError::MissingWeights {
                user_class: spec.user_class.clone(),
                demand_mode_type: if spec.outbound { "egress" } else { "access" },
                demand_mode: demand_mode.clone(),
            }
        })?;

        for (supply_mode_num, named_weights) in mode_weights {
            if trace.enabled() {
                trace.note(&format!("Weights exist for supply mode {} => {}",
                                    supply_mode_num, self.supply.mode_name(*supply_mode_num)));
            }
            let mode_links = match taz_links.get(supply_mode_num) {
                Some(links) => links,
                None => {
                    if trace.enabled() {
                        trace.note("No links for this supply mode");
                    }
                    continue;
                }
            };

            for (stop_id, attrs) in mode_links {
                let attr_time = match attrs.get("time_min") {
                    Some(time) => *time,
                    None => {
                        log::warn!("access link for TAZ {} stop {} has no time_min",
                                   start_taz_id, stop_id);
                        continue;
                    }
                };
                // outbound: departure time = destination arrival - access time
                //  inbound: arrival time   = origin departure   + access time
                let deparr_time = spec.preferred_time - attr_time * dir_factor;
                let mut link_attr = attrs.clone();
                // we start out with no delay
                link_attr.insert(String::from("preferred_delay_min"), 0.0);

                let cost = if spec.hyperpath {
                    self.supply.tally_link_cost(*supply_mode_num, named_weights, &link_attr,
                                                trace)
                } else {
                    attr_time
                };

                let ss = StopState {
                    deparr_time,
                    deparr_mode: link_mode,
                    trip_id: *supply_mode_num,
                    stop_succpred: start_taz_id,
                    seq: -1,
                    seq_succpred: -1,
                    link_time: attr_time,
                    link_cost: cost,
                    cost,
                    iteration: 0,
                    arrdep_time: spec.preferred_time,
                };
                stop_states.add_stop_state(spec.hyperpath, spec.outbound, &self.params,
                                           *stop_id, ss, queue, trace);
            }
        }
        Ok(())
    }

    /// The main labeling loop: pop the lowest-label stop and relax it via
    /// transfer links and scheduled trips until the queue drains.
    fn label_stops(&self, spec: &PathSpecification, trace: &mut TraceContext,
                   stop_states: &mut StopStates, queue: &mut LabelStopQueue)
                   -> Result<(i32, i32), PathfinderError> {
        let mut label_iterations = 1;
        let mut max_process_count = 0;
        let mut last_stop_id: Option<i32> = None;

        while !queue.empty() {
            let current_label_stop = queue.pop_top()?;

            // if we just processed this stop, relaxing it again is a no-op
            if last_stop_id == Some(current_label_stop.stop_id) {
                continue;
            }

            if spec.hyperpath {
                let process_count = stop_states.process_count(current_label_stop.stop_id);
                if self.params.stoch_max_stop_process_count > 0 &&
                   process_count == self.params.stoch_max_stop_process_count {
                    if trace.enabled() {
                        trace.note(&format!(
                            "Stop {} has been processed the limit {} times, skipping",
                            self.supply.stop_name(current_label_stop.stop_id),
                            self.params.stoch_max_stop_process_count));
                    }
                    continue;
                }
                let process_count = stop_states.bump_process_count(current_label_stop.stop_id);
                max_process_count = max_process_count.max(process_count);
            }

            if trace.enabled() {
                trace.note(&format!(
                    "Pulling from label_stop_queue (iteration {:6}, stop {}, label {:.6}) :======",
                    label_iterations, self.supply.stop_name(current_label_stop.stop_id),
                    current_label_stop.label));
                let header = trace.stop_state_header();
                trace.note(&format!("        {}", header));
                for ss in stop_states.states(current_label_stop.stop_id) {
                    let line = trace.stop_state_line(current_label_stop.stop_id, ss);
                    trace.note(&format!("        {}", line));
                }
                trace.note("==============================");
            }

            self.update_for_transfers(spec, trace, stop_states, queue, label_iterations,
                                      &current_label_stop);
            self.update_for_trips(spec, trace, stop_states, queue, label_iterations,
                                  &current_label_stop);

            label_iterations += 1;
            last_stop_id = Some(current_label_stop.stop_id);
        }
        Ok((label_iterations, max_process_count))
    }

    /// Relax the just-popped stop through its transfer links.
    fn update_for_transfers(&self, spec: &PathSpecification, trace: &mut TraceContext,
                            stop_states: &mut StopStates, queue: &mut LabelStopQueue,
                            label_iteration: i32, current_label_stop: &LabelStop) {
        let dir_factor = if spec.outbound { 1.0 } else { -1.0 };

        let (current_mode, current_trip, current_seq, current_deparr) = {
            let states = stop_states.states(current_label_stop.stop_id);
            if states.is_empty() {
                return;
            }
            (states[0].deparr_mode, states[0].trip_id, states[0].seq, states[0].deparr_time)
        };

        // no transfer to or from access and egress links
        if current_mode == DepArrMode::Egress || current_mode == DepArrMode::Access {
            return;
        }
        // deterministic: no transfer chained onto a transfer
        if !spec.hyperpath && current_mode == DepArrMode::Transfer {
            return;
        }

        let mut latest_dep_earliest_arr = current_deparr;
        let mut nonwalk_label = 0.0;
        if spec.hyperpath {
            latest_dep_earliest_arr =
                match stop_states.latest_dep_earliest_arr(current_label_stop.stop_id) {
                    Some(time) => time,
                    None => return,
                };
            nonwalk_label = StopStates::nonwalk_label(
                stop_states.states(current_label_stop.stop_id), self.params.stoch_dispersion);
            if trace.enabled() {
                trace.note(&format!("  nonwalk label:    {:.4}", nonwalk_label));
            }
            // reachable only by walking, so transferring again is not allowed
            if nonwalk_label >= MAX_COST {
                return;
            }
        }

        let transfer_ucm = UserClassMode::new(&spec.user_class, DepArrMode::Transfer, "transfer");
        let transfer_weights = match self.supply.weights(&transfer_ucm)
            .and_then(|by_mode| by_mode.get(&self.supply.transfer_supply_mode())) {
            Some(weights) => weights,
            None => return,
        };

        for (xfer_stop_id, attrs) in self.supply.transfer_neighbors(current_label_stop.stop_id,
                                                                    spec.outbound) {
            let transfer_time = match attrs.get("time_min") {
                Some(time) => *time,
                None => {
                    log::warn!("transfer link at stop {} has no time_min",
                               current_label_stop.stop_id);
                    continue;
                }
            };
            // outbound: departure time = latest departure - transfer time
            //  inbound: arrival time   = earliest arrival + transfer time
            let mut deparr_time = latest_dep_earliest_arr - transfer_time * dir_factor;
            let link_cost;
            let mut cost;

            if spec.hyperpath {
                let mut link_attr = attrs.clone();
                link_attr.insert(String::from("transfer_penalty"), 1.0);
                link_cost = self.supply.tally_link_cost(self.supply.transfer_supply_mode(),
                                                        transfer_weights, &link_attr, trace);
                cost = nonwalk_label + link_cost;
            } else {
                link_cost = transfer_time;
                cost = current_label_stop.label + link_cost;

                // capacity: someone may already be waiting at this trip/stop
                if spec.outbound {
                    let ts = TripStop {
                        trip_id: current_trip,
                        seq: current_seq,
                        stop_id: current_label_stop.stop_id,
                    };
                    if let Some(&bump_time) = self.bump_wait.get(&ts) {
                        // we can't make it in time
                        if deparr_time - self.params.time_window > bump_time {
                            continue;
                        }
                        // leave early enough to get in line before the bump
                        cost += (current_deparr - bump_time) + self.params.bump_buffer;
                        deparr_time = bump_time - transfer_time - self.params.bump_buffer;
                    }
                }
            }

            let ss = StopState {
                deparr_time,
                deparr_mode: DepArrMode::Transfer,
                trip_id: 1,
                stop_succpred: current_label_stop.stop_id,
                seq: -1,
                seq_succpred: -1,
                link_time: transfer_time,
                link_cost,
                cost,
                iteration: label_iteration,
                arrdep_time: latest_dep_earliest_arr,
            };
            stop_states.add_stop_state(spec.hyperpath, spec.outbound, &self.params,
                                       xfer_stop_id, ss, queue, trace);
        }
    }

    /// Relax the just-popped stop through the scheduled trips serving it within
    /// the admissible time window.
    fn update_for_trips(&self, spec: &PathSpecification, trace: &mut TraceContext,
                        stop_states: &mut StopStates, queue: &mut LabelStopQueue,
                        label_iteration: i32, current_label_stop: &LabelStop) {
        let dir_factor = if spec.outbound { 1.0 } else { -1.0 };

        let transit_ucm = UserClassMode::new(&spec.user_class, DepArrMode::Transit,
                                             &spec.transit_mode);
        let mode_weights = match self.supply.weights(&transit_ucm) {
            Some(weights) => weights,
            None => return,
        };

        let (current_mode, current_trip_id, current_seq, current_cost, current_deparr) = {
            let states = stop_states.states(current_label_stop.stop_id);
            if states.is_empty() {
                return;
            }
            (states[0].deparr_mode, states[0].trip_id, states[0].seq, states[0].cost,
             states[0].deparr_time)
        };
        let mut latest_dep_earliest_arr = current_deparr;
        let mut lder_trip_id = None;
        if spec.hyperpath {
            match stop_states.hyperpath_state(current_label_stop.stop_id) {
                Some(hss) => {
                    latest_dep_earliest_arr = hss.latest_dep_earliest_arr;
                    lder_trip_id = Some(hss.lder_trip_id);
                }
                None => return,
            }
        }

        let relevant_trips = self.supply.trips_within_time(
            current_label_stop.stop_id, spec.outbound, latest_dep_earliest_arr,
            self.params.time_window);
        for stt in relevant_trips {
            // don't reuse the trip that set the time boundary, or we'd likely end
            // up choosing two links in a row from the same trip
            if spec.hyperpath && lder_trip_id == Some(stt.trip_id) {
                continue;
            }

            let trip_info = match self.supply.trip_info(stt.trip_id) {
                Some(info) => info,
                None => {
                    log::warn!("trip {} has no trip info", stt.trip_id);
                    continue;
                }
            };
            // this supply mode isn't allowed for the user class / demand mode
            let named_weights = match mode_weights.get(&trip_info.supply_mode_num) {
                Some(weights) => weights,
                None => continue,
            };

            if trace.enabled() {
                trace.note(&format!("valid trips: {} {} {}",
                                    self.supply.trip_name(stt.trip_id), stt.seq,
                                    format_time(if spec.outbound { stt.arrive_time }
                                                else { stt.depart_time })));
            }

            // trip arrival time (outbound) / departure time (inbound) at the
            // current stop
            let arrdep_time = if spec.outbound { stt.arrive_time } else { stt.depart_time };
            let wait_time = (latest_dep_earliest_arr - arrdep_time) * dir_factor;
            if wait_time < 0.0 {
                log::warn!("wait_time < 0 -- this shouldn't happen");
                if trace.enabled() {
                    trace.note("wait_time < 0 -- this shouldn't happen!");
                }
            }

            // deterministic: check capacities
            if !spec.hyperpath {
                let (check_for_bump_wait, arrive_time) = if spec.outbound {
                    // this trip loop covers trips *before* the current one, so
                    // check we can get here in time for the current trip
                    (TripStop {
                        trip_id: current_trip_id,
                        seq: current_seq,
                        stop_id: current_label_stop.stop_id,
                    }, arrdep_time)
                } else {
                    // the relaxed trip is the next trip; check we can get to it
                    (TripStop {
                        trip_id: stt.trip_id,
                        seq: stt.seq,
                        stop_id: current_label_stop.stop_id,
                    }, current_deparr)
                };
                if let Some(&bump_time) = self.bump_wait.get(&check_for_bump_wait) {
                    if trace.enabled() {
                        trace.note(&format!("checking bump time {} vs arrival {} for trip {}",
                                            format_time(bump_time), format_time(arrive_time),
                                            self.supply.trip_name(stt.trip_id)));
                    }
                    if arrive_time + 0.01 >= bump_time && current_trip_id != stt.trip_id {
                        continue;
                    }
                }
            }

            let possible_stops = match self.supply.stop_times_for_trip(stt.trip_id) {
                Some(stops) => stops,
                None => continue,
            };

            // iterate the boarding candidates (outbound) / alighting candidates
            // (inbound) on the other side of the current stop
            let (start_seq, end_seq) = if spec.outbound {
                (1, stt.seq - 1)
            } else {
                (stt.seq + 1, possible_stops.len() as i32)
            };
            for seq_num in start_seq..=end_seq {
                let possible_board_alight = possible_stops[(seq_num - 1) as usize];
                let board_alight_stop = possible_board_alight.stop_id;

                // hyperpath: the successor/predecessor can't be access or egress
                if spec.hyperpath {
                    match stop_states.first_mode(board_alight_stop) {
                        Some(DepArrMode::Access) | Some(DepArrMode::Egress) => continue,
                        _ => {}
                    }
                }

                let mut deparr_time = if spec.outbound {
                    possible_board_alight.depart_time
                } else {
                    possible_board_alight.arrive_time
                };
                // the schedule crossed midnight
                if spec.outbound && arrdep_time < deparr_time {
                    deparr_time -= 24.0 * 60.0;
                    if trace.enabled() {
                        trace.note("trip crossed midnight; adjusting deparr_time");
                    }
                } else if !spec.outbound && deparr_time < arrdep_time {
                    deparr_time += 24.0 * 60.0;
                    if trace.enabled() {
                        trace.note("trip crossed midnight; adjusting deparr_time");
                    }
                }
                let in_vehicle_time = (arrdep_time - deparr_time) * dir_factor;
                if in_vehicle_time < 0.0 {
                    log::warn!("in_vehicle_time < 0 -- this shouldn't happen");
                    if trace.enabled() {
                        trace.note("in_vehicle_time < 0 -- this shouldn't happen!");
                    }
                }

                let link_cost;
                let cost;
                if spec.hyperpath {
                    let mut link_attr = trip_info.attrs.clone();
                    link_attr.insert(String::from("in_vehicle_time_min"), in_vehicle_time);
                    link_attr.insert(String::from("wait_time_min"), wait_time);

                    let mut cost_so_far = 0.0;
                    if (spec.outbound && current_mode == DepArrMode::Egress) ||
                       (!spec.outbound && current_mode == DepArrMode::Access) {
                        // the current link is as late/early as possible, so the
                        // wait is really a deviation from the preferred time
                        link_attr.insert(String::from("wait_time_min"), 0.0);
                        let mut delay_attr = Attributes::new();
                        delay_attr.insert(String::from("time_min"), 0.0);
                        delay_attr.insert(String::from("preferred_delay_min"), wait_time);
                        let delay_mode = if spec.outbound { &spec.egress_mode }
                                         else { &spec.access_mode };
                        let delay_ucm = UserClassMode::new(&spec.user_class, current_mode,
                                                           delay_mode);
                        if let Some(weights) = self.supply.weights(&delay_ucm)
                            .and_then(|by_mode| by_mode.get(&current_trip_id)) {
                            cost_so_far = self.supply.tally_link_cost(
                                current_trip_id, weights, &delay_attr, trace);
                        }
                    } else if current_mode.is_trip() {
                        // a zero-walk transfer still needs the penalty
                        let mut xfer_attr = Attributes::new();
                        xfer_attr.insert(String::from("transfer_penalty"), 1.0);
                        xfer_attr.insert(String::from("walk_time_min"), 0.0);
                        let xfer_ucm = UserClassMode::new(&spec.user_class,
                                                          DepArrMode::Transfer, "transfer");
                        if let Some(weights) = self.supply.weights(&xfer_ucm)
                            .and_then(|by_mode| by_mode.get(
                                &self.supply.transfer_supply_mode())) {
                            cost_so_far = self.supply.tally_link_cost(
                                self.supply.transfer_supply_mode(), weights, &xfer_attr,
                                trace);
                        }
                    }

                    let transfer_penalty = if current_mode == DepArrMode::Access ||
                                              current_mode == DepArrMode::Egress { 0.0 }
                                           else { 1.0 };
                    link_attr.insert(String::from("transfer_penalty"), transfer_penalty);

                    link_cost = cost_so_far + self.supply.tally_link_cost(
                        trip_info.supply_mode_num, named_weights, &link_attr, trace);
                    cost = stop_states.hyperpath_cost(current_label_stop.stop_id) + link_cost;
                } else {
                    link_cost = in_vehicle_time + wait_time;
                    cost = current_cost + link_cost;
                }

                let ss = StopState {
                    deparr_time,
                    deparr_mode: DepArrMode::Transit,
                    trip_id: possible_board_alight.trip_id,
                    stop_succpred: current_label_stop.stop_id,
                    seq: possible_board_alight.seq,
                    seq_succpred: stt.seq,
                    link_time: in_vehicle_time + wait_time,
                    link_cost,
                    cost,
                    iteration: label_iteration,
                    arrdep_time,
                };
                stop_states.add_stop_state(spec.hyperpath, spec.outbound, &self.params,
                                           board_alight_stop, ss, queue, trace);
            }
        }
    }

    /// Mirror of the initialization, toward the final TAZ: the origin for
    /// outbound searches, the destination for inbound ones.
    fn finalize_taz_state(&self, spec: &PathSpecification, trace: &mut TraceContext,
                          stop_states: &mut StopStates, queue: &mut LabelStopQueue,
                          label_iteration: i32) -> Result<(), PathfinderError> {
        let end_taz_id = if spec.outbound { spec.origin_taz_id } else { spec.destination_taz_id };
        let dir_factor = if spec.outbound { 1.0 } else { -1.0 };

        let taz_links = self.supply.access_links(end_taz_id)
            .ok_or(PathfinderError::NoAccessEgressLinks(end_taz_id))?;

        let link_mode = if spec.outbound { DepArrMode::Access } else { DepArrMode::Egress };
        let demand_mode = if spec.outbound { &spec.access_mode } else { &spec.egress_mode };
        let ucm = UserClassMode::new(&spec.user_class, link_mode, demand_mode);
        let mode_weights = self.supply.weights(&ucm).ok_or_else(|| {
            PathfinderError::MissingWeights {
                user_class: spec.user_class.clone(),
                demand_mode_type: if spec.outbound { "access" } else { "egress" },
                demand_mode: demand_mode.clone(),
            }
        })?;

        for (supply_mode_num, named_weights) in mode_weights {
            if trace.enabled() {
                trace.note(&format!("Weights exist for supply mode {} => {}",
                                    supply_mode_num, self.supply.mode_name(*supply_mode_num)));
            }
            let mode_links = match taz_links.get(supply_mode_num) {
                Some(links) => links,
                None => {
                    if trace.enabled() {
                        trace.note("No links for this supply mode");
                    }
                    continue;
                }
            };

            for (stop_id, attrs) in mode_links {
                let access_time = match attrs.get("time_min") {
                    Some(time) => *time,
                    None => {
                        log::warn!("access link for TAZ {} stop {} has no time_min",
                                   end_taz_id, stop_id);
                        continue;
                    }
                };

                let (first_state, earliest_dep_latest_arr, nonwalk_label) = {
                    let states = stop_states.states(*stop_id);
                    if states.is_empty() {
                        continue;
                    }
                    let mut edla = states[0].deparr_time;
                    if spec.hyperpath {
                        for ss in states {
                            edla = if spec.outbound {
                                edla.min(ss.deparr_time)
                            } else {
                                edla.max(ss.deparr_time)
                            };
                        }
                    }
                    let nonwalk = if spec.hyperpath {
                        StopStates::nonwalk_label(states, self.params.stoch_dispersion)
                    } else {
                        0.0
                    };
                    (states[0], edla, nonwalk)
                };

                let mut link_attr = attrs.clone();
                link_attr.insert(String::from("preferred_delay_min"), 0.0);

                let mut deparr_time = earliest_dep_latest_arr - access_time * dir_factor;
                let link_cost;
                let mut cost;
                if spec.hyperpath {
                    // a stop reached only by walking can't be walked from again
                    if nonwalk_label >= MAX_COST {
                        continue;
                    }
                    link_cost = self.supply.tally_link_cost(*supply_mode_num, named_weights,
                                                            &link_attr, trace);
                    cost = nonwalk_label + link_cost;
                } else {
                    // the first leg has to be a trip
                    match first_state.deparr_mode {
                        DepArrMode::Transfer | DepArrMode::Egress | DepArrMode::Access => {
                            continue;
                        }
                        DepArrMode::Transit => {}
                    }
                    link_cost = access_time;
                    cost = first_state.cost + link_cost;

                    // capacity check
                    if spec.outbound {
                        let ts = TripStop {
                            trip_id: first_state.trip_id,
                            seq: first_state.seq,
                            stop_id: *stop_id,
                        };
                        if let Some(&bump_time) = self.bump_wait.get(&ts) {
                            // we can't make it in time
                            if deparr_time - self.params.time_window > bump_time {
                                continue;
                            }
                            // leave early enough to get in line before the bump
                            cost += (first_state.deparr_time - bump_time) +
                                    self.params.bump_buffer;
                            deparr_time = bump_time - access_time - self.params.bump_buffer;
                        }
                    }
                }

                let ss = StopState {
                    deparr_time,
                    deparr_mode: link_mode,
                    trip_id: *supply_mode_num,
                    stop_succpred: *stop_id,
                    seq: -1,
                    seq_succpred: -1,
                    link_time: access_time,
                    link_cost,
                    cost,
                    iteration: label_iteration,
                    arrdep_time: earliest_dep_latest_arr,
                };
                stop_states.add_stop_state(spec.hyperpath, spec.outbound, &self.params,
                                           end_taz_id, ss, queue, trace);
            }
        }
        Ok(())
    }

    /// Produce the chosen path: chase back-pointers for deterministic searches,
    /// sample and re-pick for hyperpaths.  Returns None when no path exists.
    fn get_found_path(&self, spec: &PathSpecification, trace: &mut TraceContext,
                      stop_states: &StopStates) -> Option<(Path, PathInfo)> {
        let end_taz_id = if spec.outbound { spec.origin_taz_id } else { spec.destination_taz_id };
        if stop_states.states(end_taz_id).is_empty() {
            return None;
        }

        if spec.hyperpath {
            // the random stream is derived from the path id so results are
            // reproducible per demand even across threads
            let mut rng = Isaac64Rng::seed_from_u64(spec.path_id as u64);

            let mut paths: BTreeMap<Path, PathInfo> = BTreeMap::new();
            for attempt in 1..=self.params.stoch_pathset_size {
                match self.hyperpath_generate_path(spec, trace, stop_states, &mut rng) {
                    Some(new_path) => {
                        if trace.enabled() {
                            let compat = trace.path_compat(&new_path);
                            trace.note(&format!("----> Found path {}{}", attempt, compat));
                            trace.print_path(&new_path);
                        }
                        paths.entry(new_path).or_insert_with(PathInfo::default).count += 1;
                    }
                    None => {
                        if trace.enabled() {
                            trace.note("----> No path found");
                        }
                    }
                }
            }

            // recompute the costs now that each path's links are concrete
            let mut paths_updated_cost: BTreeMap<Path, PathInfo> = BTreeMap::new();
            let mut logsum = 0.0;
            for (path, info) in paths {
                let mut path_updated = path;
                let mut info_updated = info;
                self.calculate_path_cost(spec, trace, &mut path_updated, &mut info_updated);
                if info_updated.cost > 0.0 {
                    logsum += (-self.params.stoch_dispersion * info_updated.cost).exp();
                }
                paths_updated_cost.insert(path_updated, info_updated);
            }
            if logsum == 0.0 {
                return None;
            }

            let mut cum_prob: i64 = 0;
            for (path, info) in paths_updated_cost.iter_mut() {
                info.probability =
                    (-self.params.stoch_dispersion * info.cost).exp() / logsum;
                let prob_i = (PROBABILITY_SCALE as f64 * info.probability) as i64;
                // too small to consider
                if prob_i < PROBABILITY_CUTOFF {
                    continue;
                }
                cum_prob += prob_i;
                info.prob_i = cum_prob;
                if trace.enabled() {
                    let compat = trace.path_compat(path);
                    trace.note(&format!(
                        "-> probability {:8.6}; prob_i {:8}; count {:4}; cost {:8.4}  {}",
                        info.probability, info.prob_i, info.count, info.cost, compat));
                }
                trace.pathset_row(spec.iteration, spec.passenger_id, spec.path_id, info, path);
            }
            if cum_prob == 0 {
                return None;
            }

            self.choose_path(trace, &mut rng, &paths_updated_cost, cum_prob)
        } else {
            let mut path = self.extract_deterministic_path(spec, stop_states);
            let mut path_info = PathInfo::default();
            self.calculate_path_cost(spec, trace, &mut path, &mut path_info);
            Some((path, path_info))
        }
    }

    /// Chase successor/predecessor pointers from the final TAZ, fixing link
    /// times for chronological consistency as links are appended.
    fn extract_deterministic_path(&self, spec: &PathSpecification, stop_states: &StopStates)
                                  -> Path {
        let end_taz_id = if spec.outbound { spec.origin_taz_id } else { spec.destination_taz_id };
        let final_state_mode = if spec.outbound { DepArrMode::Egress } else { DepArrMode::Access };

        // there's only one state per stop in deterministic mode
        let mut ss = stop_states.states(end_taz_id)[0];
        let mut path: Path = vec![(end_taz_id, ss)];

        while ss.deparr_mode != final_state_mode {
            let stop_id = ss.stop_succpred;
            let states = stop_states.states(stop_id);
            if states.is_empty() {
                log::error!("back-pointer chain broke at stop {}", stop_id);
                break;
            }
            ss = states[0];
            path.push((stop_id, ss));

            let curr = path.len() - 1;
            let prev = curr - 1;
            if spec.outbound {
                if path[prev].1.deparr_mode == DepArrMode::Access {
                    // leave the origin as late as possible
                    path[prev].1.arrdep_time = ss.deparr_time;
                    path[prev].1.deparr_time = path[prev].1.arrdep_time - path[prev].1.link_time;
                    // no wait time for the trip
                    path[curr].1.link_time = path[curr].1.arrdep_time - path[curr].1.deparr_time;
                } else if path[curr].1.deparr_mode.is_trip() {
                    // link time is arrival time minus previous arrival time
                    path[curr].1.link_time = path[curr].1.arrdep_time - path[prev].1.arrdep_time;
                } else if path[curr].1.deparr_mode == DepArrMode::Transfer {
                    // start transferring immediately
                    path[curr].1.deparr_time = path[prev].1.arrdep_time;
                    path[curr].1.arrdep_time = path[curr].1.deparr_time + path[curr].1.link_time;
                } else if ss.deparr_mode == DepArrMode::Egress {
                    // don't wait, just walk
                    path[curr].1.deparr_time = path[prev].1.arrdep_time;
                    path[curr].1.arrdep_time = path[curr].1.deparr_time + path[curr].1.link_time;
                }
            } else {
                // inbound builds the path in reverse chronological order
                if path[curr].1.deparr_mode == DepArrMode::Access {
                    path[curr].1.deparr_time = path[prev].1.arrdep_time;
                    path[curr].1.arrdep_time = path[curr].1.deparr_time - path[curr].1.link_time;
                    // no wait time for the trip
                    path[prev].1.link_time = path[prev].1.deparr_time - path[prev].1.arrdep_time;
                } else if path[curr].1.deparr_mode.is_trip() {
                    if path[prev].1.deparr_mode == DepArrMode::Transfer {
                        // transfer right after arriving, and give the wait time
                        // to the next trip rather than the transfer
                        path[prev].1.arrdep_time = path[curr].1.deparr_time;
                        path[prev].1.deparr_time = path[curr].1.deparr_time +
                                                   path[prev].1.link_time;
                        path[prev - 1].1.link_time = path[prev - 1].1.deparr_time -
                                                     path[prev].1.deparr_time;
                    } else if path[prev].1.deparr_mode.is_trip() {
                        // zero-walk transfer: the next trip absorbs the wait
                        path[prev].1.link_time = path[prev].1.deparr_time -
                                                 path[curr].1.deparr_time;
                    }
                }
                if path[prev].1.deparr_mode == DepArrMode::Egress {
                    // don't wait at the end, just walk
                    path[prev].1.arrdep_time = ss.deparr_time;
                    path[prev].1.deparr_time = path[prev].1.arrdep_time +
                                               path[prev].1.link_time;
                }
            }
        }
        return path;
    }

    /// Sample one concrete path by soft-max choice over the state alternatives
    /// at each hop, fixing link times as links are chosen.
    fn hyperpath_generate_path(&self, spec: &PathSpecification, trace: &mut TraceContext,
                               stop_states: &StopStates, rng: &mut Isaac64Rng) -> Option<Path> {
        let start_taz_id = if spec.outbound { spec.origin_taz_id } else { spec.destination_taz_id };
        let dir_factor = if spec.outbound { 1.0 } else { -1.0 };
        let dispersion = self.params.stoch_dispersion;

        let taz_state = stop_states.states(start_taz_id);
        let taz_label = stop_states.hyperpath_cost(start_taz_id);

        // set up the access/egress probabilities
        let mut access_cum_prob: Vec<ProbabilityStop> = vec![];
        for (index, state) in taz_state.iter().enumerate() {
            let probability = (-dispersion * state.cost).exp() / (-dispersion * taz_label).exp();
            let prob_i = (PROBABILITY_SCALE as f64 * probability) as i64;
            // too small to consider
            if prob_i < PROBABILITY_CUTOFF {
                continue;
            }
            let cum = access_cum_prob.last().map(|pb| pb.prob_i).unwrap_or(0) + prob_i;
            if trace.enabled() {
                let line = trace.stop_state_line(start_taz_id, state);
                trace.note(&format!("{} : prob {:10.6} cum_prob {:6}", line, probability, cum));
            }
            access_cum_prob.push(ProbabilityStop {
                probability,
                prob_i: cum,
                index,
            });
        }
        if access_cum_prob.is_empty() {
            return None;
        }

        let chosen_index = self.choose_state(trace, rng, &access_cum_prob)?;
        let ss = taz_state[chosen_index];
        let mut path: Path = vec![(start_taz_id, ss)];
        if trace.enabled() {
            let line = trace.stop_state_line(start_taz_id, &ss);
            trace.note(&format!(" -> Chose access/egress {}", line));
        }

        let mut current_stop_id = ss.stop_succpred;
        // outbound: arrival time; inbound: departure time
        let mut arrdep_time = ss.deparr_time + ss.link_time * dir_factor;
        let mut prev_mode = ss.deparr_mode;
        let mut prev_trip_id = ss.trip_id;

        loop {
            let states = stop_states.states(current_stop_id);
            if states.is_empty() {
                return None;
            }
            if trace.enabled() {
                trace.note(&format!("current_stop={}; {}={}; prev_mode={}",
                                    self.supply.stop_name(current_stop_id),
                                    if spec.outbound { "arrival_time" } else { "departure_time" },
                                    format_time(arrdep_time),
                                    trace.mode_label(prev_mode, prev_trip_id)));
            }

            let mut stop_cum_prob: Vec<ProbabilityStop> = vec![];
            let mut sum_exp = 0.0;
            for (index, state) in states.iter().enumerate() {
                // no repeat of access/egress
                if spec.outbound && state.deparr_mode == DepArrMode::Access {
                    continue;
                }
                if !spec.outbound && state.deparr_mode == DepArrMode::Egress {
                    continue;
                }
                // no double walk
                if spec.outbound &&
                   (state.deparr_mode == DepArrMode::Egress ||
                    state.deparr_mode == DepArrMode::Transfer) &&
                   (prev_mode == DepArrMode::Access || prev_mode == DepArrMode::Transfer) {
                    continue;
                }
                if !spec.outbound &&
                   (state.deparr_mode == DepArrMode::Access ||
                    state.deparr_mode == DepArrMode::Transfer) &&
                   (prev_mode == DepArrMode::Egress || prev_mode == DepArrMode::Transfer) {
                    continue;
                }
                // two links in a row on the same trip are already one link
                if state.deparr_mode.is_trip() && state.trip_id == prev_trip_id {
                    continue;
                }
                // outbound: we cannot depart before we arrive
                if spec.outbound && state.deparr_time < arrdep_time {
                    continue;
                }
                // inbound: we cannot arrive after we depart
                if !spec.outbound && state.deparr_time > arrdep_time {
                    continue;
                }

                sum_exp += (-dispersion * state.cost).exp();
                // probabilities are filled in once the denominator is known
                stop_cum_prob.push(ProbabilityStop {
                    probability: state.cost,
                    prob_i: 0,
                    index,
                });
            }

            // dead end
            if stop_cum_prob.is_empty() || sum_exp == 0.0 {
                return None;
            }

            let mut cum: i64 = 0;
            for pb in stop_cum_prob.iter_mut() {
                let probability = (-dispersion * pb.probability).exp() / sum_exp;
                let prob_i = (PROBABILITY_SCALE as f64 * probability) as i64;
                pb.probability = probability;
                cum += prob_i;
                pb.prob_i = cum;
                if trace.enabled() {
                    let line = trace.stop_state_line(current_stop_id, &states[pb.index]);
                    trace.note(&format!("{} : prob {:10.6} cum_prob {:6}",
                                        line, probability, cum));
                }
            }
            // every alternative was pruned by integerization
            if cum == 0 {
                return None;
            }

            let chosen_index = self.choose_state(trace, rng, &stop_cum_prob)?;
            let mut next_ss = states[chosen_index];
            if trace.enabled() {
                let line = trace.stop_state_line(current_stop_id, &next_ss);
                trace.note(&format!(" -> Chose stop link {}", line));
            }

            // Sampling produced a link whose labeling-time wait/times were only
            // estimates; rectify them now that the concrete choice is known.
            if spec.outbound {
                // links are being chosen in chronological order
                if prev_mode == DepArrMode::Access {
                    // depart the origin as late as possible to catch the vehicle
                    if let Some(dep_time) = self.supply.scheduled_departure(
                        next_ss.trip_id, current_stop_id, next_ss.seq) {
                        let last = path.last_mut().unwrap();
                        last.1.arrdep_time = dep_time;
                        last.1.deparr_time = dep_time - last.1.link_time;
                        // no wait time for the trip
                        next_ss.link_time = next_ss.arrdep_time - next_ss.deparr_time;
                    }
                } else if next_ss.deparr_mode.is_trip() {
                    // link time is arrival time minus previous arrival time
                    next_ss.link_time = next_ss.arrdep_time - arrdep_time;
                } else if next_ss.deparr_mode == DepArrMode::Transfer {
                    // start transferring immediately
                    next_ss.deparr_time = path.last().unwrap().1.arrdep_time;
                    next_ss.arrdep_time = next_ss.deparr_time + next_ss.link_time;
                } else if next_ss.deparr_mode == DepArrMode::Egress {
                    // don't wait, just walk
                    next_ss.deparr_time = path.last().unwrap().1.arrdep_time;
                    next_ss.arrdep_time = next_ss.deparr_time + next_ss.link_time;
                }
            } else {
                // links are being chosen in reverse chronological order
                if next_ss.deparr_mode == DepArrMode::Access {
                    let (back_trip, back_seq) = {
                        let back = &path.last().unwrap().1;
                        (back.trip_id, back.seq_succpred)
                    };
                    // arrive at the first stop just in time for the vehicle
                    if let Some(dep_time) = self.supply.scheduled_departure(
                        back_trip, current_stop_id, back_seq) {
                        next_ss.deparr_time = dep_time;
                        next_ss.arrdep_time = next_ss.deparr_time - next_ss.link_time;
                        // no wait time for the trip
                        let last = path.last_mut().unwrap();
                        last.1.link_time = last.1.deparr_time - last.1.arrdep_time;
                    }
                } else if next_ss.deparr_mode.is_trip() {
                    // pretend the wait is zero for now, so transfers are judged
                    // accurately on the next choice
                    next_ss.link_time = next_ss.deparr_time - next_ss.arrdep_time;
                    if prev_mode == DepArrMode::Transfer {
                        // the wait is known now; transfer right after arriving
                        // and give the wait to the later trip
                        let len = path.len();
                        path[len - 1].1.arrdep_time = next_ss.deparr_time;
                        path[len - 1].1.deparr_time = next_ss.deparr_time +
                                                      path[len - 1].1.link_time;
                        path[len - 2].1.link_time = path[len - 2].1.deparr_time -
                                                    path[len - 1].1.deparr_time;
                    } else if prev_mode.is_trip() {
                        // zero-walk transfer: the later trip absorbs the wait
                        let len = path.len();
                        path[len - 1].1.link_time = path[len - 1].1.deparr_time -
                                                    next_ss.deparr_time;
                    }
                } else if next_ss.deparr_mode == DepArrMode::Transfer {
                    // transfer as late as possible to keep earlier trips open
                    next_ss.deparr_time = path.last().unwrap().1.arrdep_time;
                    next_ss.arrdep_time = next_ss.deparr_time - next_ss.link_time;
                }
                if prev_mode == DepArrMode::Egress {
                    // don't wait at the destination, just walk
                    let last = path.last_mut().unwrap();
                    last.1.arrdep_time = next_ss.deparr_time;
                    last.1.deparr_time = last.1.arrdep_time + last.1.link_time;
                }
            }

            path.push((current_stop_id, next_ss));
            current_stop_id = next_ss.stop_succpred;
            prev_mode = next_ss.deparr_mode;
            prev_trip_id = next_ss.trip_id;
            arrdep_time = next_ss.arrdep_time;

            if trace.enabled() {
                let (last_stop, last_ss) = *path.last().unwrap();
                let line = trace.stop_state_line(last_stop, &last_ss);
                trace.note(&format!(" ->    Updated link {}", line));
            }

            // are we done?
            if (spec.outbound && next_ss.deparr_mode == DepArrMode::Egress) ||
               (!spec.outbound && next_ss.deparr_mode == DepArrMode::Access) {
                break;
            }
        }
        Some(path)
    }

    // draw from an integer-cumulative distribution; returns the chosen index
    fn choose_state(&self, trace: &mut TraceContext, rng: &mut Isaac64Rng,
                    prob_stops: &[ProbabilityStop]) -> Option<usize> {
        let max_prob_i = prob_stops.last()?.prob_i;
        if max_prob_i <= 0 {
            return None;
        }
        let random_num = rng.gen_range(0..max_prob_i);
        if trace.enabled() {
            trace.note(&format!("random_num {} of {}", random_num, max_prob_i));
        }
        for pb in prob_stops {
            if pb.prob_i == 0 {
                continue;
            }
            if random_num <= pb.prob_i {
                return Some(pb.index);
            }
        }
        log::error!("state choice fell through the cumulative distribution");
        None
    }

    fn choose_path(&self, trace: &mut TraceContext, rng: &mut Isaac64Rng,
                   paths: &BTreeMap<Path, PathInfo>, max_prob_i: i64)
                   -> Option<(Path, PathInfo)> {
        let random_num = rng.gen_range(0..max_prob_i);
        if trace.enabled() {
            trace.note(&format!("random_num {} of {}", random_num, max_prob_i));
        }
        for (path, info) in paths {
            if info.prob_i == 0 {
                continue;
            }
            if random_num <= info.prob_i {
                return Some((path.clone(), *info));
            }
        }
        log::error!("path choice fell through the cumulative distribution");
        None
    }

    /// Recompute the generalized cost over a concrete path now that every wait
    /// and transfer is known, splicing in zero-length transfer links between
    /// consecutive trips.  Updates each link's cost and the path total.
    fn calculate_path_cost(&self, spec: &PathSpecification, trace: &mut TraceContext,
                           path: &mut Path, path_info: &mut PathInfo) {
        if path.is_empty() {
            return;
        }
        if trace.enabled() {
            trace.note("calculate_path_cost:");
            trace.print_path(path);
        }

        let dir_factor = if spec.outbound { 1.0 } else { -1.0 };
        let mut first_trip = true;

        // iterate the links in chronological order
        let mut index: isize = if spec.outbound { 0 } else { path.len() as isize - 1 };
        let mut end_ind: isize = if spec.outbound { path.len() as isize } else { -1 };
        let inc: isize = if spec.outbound { 1 } else { -1 };

        path_info.cost = 0.0;
        while index != end_ind {
            let (stop_id, ss) = path[index as usize];
            let link_cost;

            match ss.deparr_mode {
                DepArrMode::Access => {
                    // inbound: the preferred time is the origin departure time
                    let orig_departure_time = if spec.outbound {
                        ss.deparr_time
                    } else {
                        ss.deparr_time - ss.link_time
                    };
                    let preference_delay = if spec.outbound {
                        0.0
                    } else {
                        (orig_departure_time - spec.preferred_time).max(0.0)
                    };
                    let transit_stop = if spec.outbound { ss.stop_succpred } else { stop_id };
                    let ucm = UserClassMode::new(&spec.user_class, DepArrMode::Access,
                                                 &spec.access_mode);
                    link_cost = match (
                        self.supply.weights(&ucm).and_then(|by_mode| by_mode.get(&ss.trip_id)),
                        self.supply.access_link_attrs(spec.origin_taz_id, ss.trip_id,
                                                      transit_stop)) {
                        (Some(weights), Some(attrs)) => {
                            let mut link_attr = attrs.clone();
                            link_attr.insert(String::from("preferred_delay_min"),
                                             preference_delay);
                            self.supply.tally_link_cost(ss.trip_id, weights, &link_attr, trace)
                        }
                        _ => {
                            log::warn!("no weights or attributes for access link at stop {}",
                                       stop_id);
                            0.0
                        }
                    };
                }
                DepArrMode::Egress => {
                    // outbound: the preferred time is the destination arrival
                    let dest_arrival_time = if spec.outbound {
                        ss.deparr_time + ss.link_time
                    } else {
                        ss.deparr_time
                    };
                    let preference_delay = if spec.outbound {
                        (spec.preferred_time - dest_arrival_time).max(0.0)
                    } else {
                        0.0
                    };
                    let transit_stop = if spec.outbound { stop_id } else { ss.stop_succpred };
                    let ucm = UserClassMode::new(&spec.user_class, DepArrMode::Egress,
                                                 &spec.egress_mode);
                    link_cost = match (
                        self.supply.weights(&ucm).and_then(|by_mode| by_mode.get(&ss.trip_id)),
                        self.supply.access_link_attrs(spec.destination_taz_id, ss.trip_id,
                                                      transit_stop)) {
                        (Some(weights), Some(attrs)) => {
                            let mut link_attr = attrs.clone();
                            link_attr.insert(String::from("preferred_delay_min"),
                                             preference_delay);
                            self.supply.tally_link_cost(ss.trip_id, weights, &link_attr, trace)
                        }
                        _ => {
                            log::warn!("no weights or attributes for egress link at stop {}",
                                       stop_id);
                            0.0
                        }
                    };
                }
                DepArrMode::Transfer => {
                    let (orig_stop, dest_stop) = if spec.outbound {
                        (stop_id, ss.stop_succpred)
                    } else {
                        (ss.stop_succpred, stop_id)
                    };
                    let mut link_attr = if orig_stop != dest_stop {
                        match self.supply.transfer_attrs(orig_stop, dest_stop) {
                            Some(attrs) => attrs.clone(),
                            None => {
                                log::warn!("no transfer attributes for {} -> {}",
                                           orig_stop, dest_stop);
                                Attributes::new()
                            }
                        }
                    } else {
                        // synthetic no-walk transfer between trips at one stop
                        let mut attrs = Attributes::new();
                        attrs.insert(String::from("walk_time_min"), 0.0);
                        attrs
                    };
                    link_attr.insert(String::from("transfer_penalty"), 1.0);
                    let ucm = UserClassMode::new(&spec.user_class, DepArrMode::Transfer,
                                                 "transfer");
                    link_cost = match self.supply.weights(&ucm)
                        .and_then(|by_mode| by_mode.get(&self.supply.transfer_supply_mode())) {
                        Some(weights) => self.supply.tally_link_cost(
                            self.supply.transfer_supply_mode(), weights, &link_attr, trace),
                        None => {
                            log::warn!("no transfer weights for user class {}", spec.user_class);
                            0.0
                        }
                    };
                }
                DepArrMode::Transit => {
                    let trip_ivt_min = (ss.arrdep_time - ss.deparr_time) * dir_factor;
                    let wait_min = ss.link_time - trip_ivt_min;
                    let ucm = UserClassMode::new(&spec.user_class, DepArrMode::Transit,
                                                 &spec.transit_mode);
                    link_cost = match self.supply.trip_info(ss.trip_id) {
                        Some(trip_info) => match self.supply.weights(&ucm)
                            .and_then(|by_mode| by_mode.get(&trip_info.supply_mode_num)) {
                            Some(weights) => {
                                let mut link_attr = trip_info.attrs.clone();
                                link_attr.insert(String::from("in_vehicle_time_min"),
                                                 trip_ivt_min);
                                link_attr.insert(String::from("wait_time_min"), wait_min);
                                link_attr.insert(String::from("transfer_penalty"),
                                                 if first_trip { 0.0 } else { 1.0 });
                                self.supply.tally_link_cost(trip_info.supply_mode_num,
                                                            weights, &link_attr, trace)
                            }
                            None => {
                                log::warn!("no transit weights for supply mode {}",
                                           trip_info.supply_mode_num);
                                0.0
                            }
                        },
                        None => {
                            log::warn!("trip {} has no trip info", ss.trip_id);
                            0.0
                        }
                    };
                    first_trip = false;
                }
            }

            path[index as usize].1.cost = link_cost;
            path_info.cost += link_cost;

            // consecutive trips with no walking transfer between them get a
            // synthetic zero-length transfer link spliced in
            let next = index + inc;
            if ss.deparr_mode.is_trip() && next != end_ind &&
               path[next as usize].1.deparr_mode.is_trip() {
                let xfer_stop_id = if spec.outbound { ss.stop_succpred } else { stop_id };
                let xfer_time = if spec.outbound { ss.arrdep_time } else { ss.deparr_time };
                let xfer_state = StopState {
                    deparr_time: xfer_time,
                    deparr_mode: DepArrMode::Transfer,
                    trip_id: self.supply.transfer_supply_mode(),
                    stop_succpred: xfer_stop_id,
                    seq: -1,
                    seq_succpred: -1,
                    link_time: 0.0,
                    link_cost: 0.0,
                    cost: link_cost,
                    iteration: -1,
                    arrdep_time: xfer_time,
                };
                if trace.enabled() {
                    let line = trace.stop_state_line(xfer_stop_id, &xfer_state);
                    trace.note(&format!("Adding {}", line));
                }
                if spec.outbound {
                    // going forward, insert after the current link
                    path.insert((index + 1) as usize, (xfer_stop_id, xfer_state));
                    end_ind += 1;
                } else {
                    // going backward, insert before the current link
                    path.insert(index as usize, (stop_id, xfer_state));
                    index += 1;
                }
            }

            index += inc;
        }

        if trace.enabled() {
            trace.note(&format!(
                " ==================================================> cost: {:.4}",
                path_info.cost));
            trace.print_path(path);
        }
    }
}


fn package_path(path: &Path) -> (Array2<i32>, Array2<f64>) {
    let mut path_int = Array2::<i32>::zeros((path.len(), 6));
    let mut path_real = Array2::<f64>::zeros((path.len(), 5));
    for (ii, (stop_id, ss)) in path.iter().enumerate() {
        path_int[[ii, 0]] = *stop_id;
        path_int[[ii, 1]] = ss.deparr_mode.to_int();
        path_int[[ii, 2]] = ss.trip_id;
        path_int[[ii, 3]] = ss.stop_succpred;
        path_int[[ii, 4]] = ss.seq;
        path_int[[ii, 5]] = ss.seq_succpred;
        // the first real column is reserved for the label
        path_real[[ii, 1]] = ss.deparr_time;
        path_real[[ii, 2]] = ss.link_time;
        path_real[[ii, 3]] = ss.cost;
        path_real[[ii, 4]] = ss.arrdep_time;
    }
    return (path_int, path_real);
}


#[cfg(test)]
mod tests {
    use super::*;

    // a little network with two chained trips at one shared stop: TAZ 100
    // -> s1 -(t1)-> s2 -(t2)-> s3 -> TAZ 200, no walking transfer links
    fn chained_trip_finder() -> PathFinder {
        let mut supply = Supply::new();
        for (num, name) in &[(1, "s1"), (2, "s2"), (3, "s3")] {
            supply.add_stop_id(*num, name);
        }
        supply.add_supply_mode(1, "walk");
        supply.add_supply_mode(2, "bus");
        supply.add_supply_mode(3, "transfer");
        supply.add_trip_id(11, "blue_1");
        supply.add_trip_id(12, "green_1");
        supply.add_route_id(1, "blue");
        supply.add_route_id(2, "green");
        supply.add_trip_info(11, 2, 1, Attributes::new());
        supply.add_trip_info(12, 2, 2, Attributes::new());

        let index = array![[11, 1, 1], [11, 2, 2], [12, 1, 2], [12, 2, 3]];
        let times = array![[480.0, 480.0], [490.0, 490.0],
                           [495.0, 495.0], [505.0, 505.0]];
        supply.set_stop_times(index.view(), times.view()).unwrap();

        let mut access = Attributes::new();
        access.insert(String::from("time_min"), 3.0);
        supply.add_access_link(100, 1, 1, access);
        let mut egress = Attributes::new();
        egress.insert(String::from("time_min"), 2.0);
        supply.add_access_link(200, 1, 3, egress);

        supply.add_weight("all", DepArrMode::Access, "walk", 1, "time_min", 1.0);
        supply.add_weight("all", DepArrMode::Egress, "walk", 1, "time_min", 1.0);
        supply.add_weight("all", DepArrMode::Transit, "bus", 2, "in_vehicle_time_min", 1.0);
        supply.add_weight("all", DepArrMode::Transit, "bus", 2, "wait_time_min", 1.0);
        supply.add_weight("all", DepArrMode::Transfer, "transfer", 3, "transfer_penalty", 2.0);

        PathFinder::new(SearchParams::default(), supply, FsPath::new("."))
    }

    fn outbound_spec() -> PathSpecification {
        PathSpecification {
            iteration: 1,
            passenger_id: 1,
            path_id: 1,
            hyperpath: false,
            user_class: String::from("all"),
            access_mode: String::from("walk"),
            transit_mode: String::from("bus"),
            egress_mode: String::from("walk"),
            origin_taz_id: 100,
            destination_taz_id: 200,
            outbound: true,
            preferred_time: 510.0,
            trace: false,
        }
    }

    #[test]
    fn test_reconciler_splices_transfer_between_trips() {
        let finder = chained_trip_finder();
        let spec = outbound_spec();
        let result = finder.find_path(&spec).unwrap();
        assert!(result.path_found());

        let modes: Vec<DepArrMode> = result.states.iter().map(|(_, ss)| ss.deparr_mode).
            collect();
        assert_eq!(modes, vec![DepArrMode::Access, DepArrMode::Transit, DepArrMode::Transfer,
                               DepArrMode::Transit, DepArrMode::Egress]);
        // the spliced transfer is a zero-length same-stop link
        let (xfer_stop, xfer) = result.states[2];
        assert_eq!(xfer_stop, 2);
        assert_eq!(xfer.stop_succpred, 2);
        assert_eq!(xfer.link_time, 0.0);

        // access 3 + t1 ivt 10 + penalty 2 + t2 (ivt 10 + wait 5) + egress 2
        assert!((result.total_cost - 32.0).abs() < 1e-6);
    }

    #[test]
    fn test_reconciliation_is_idempotent() {
        let finder = chained_trip_finder();
        let spec = outbound_spec();
        let mut trace = TraceContext::disabled(finder.supply());

        let result = finder.find_path(&spec).unwrap();
        let mut path = result.states.clone();
        let mut info = PathInfo::default();
        finder.calculate_path_cost(&spec, &mut trace, &mut path, &mut info);

        // the path already has its transfer links, so nothing new is spliced
        // and the total is unchanged
        assert_eq!(path.len(), result.states.len());
        assert!((info.cost - result.total_cost).abs() < 1e-9);
    }

    #[test]
    fn test_bad_bump_wait_shape_rejected() {
        let mut finder = chained_trip_finder();
        let index = array![[11, 1, 1, 0]];
        let times = array![478.0];
        assert!(finder.set_bump_wait(index.view(), times.view()).is_err());
    }
}

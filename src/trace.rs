use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path as FsPath;

use itertools::Itertools;

use crate::path_states::{DepArrMode, Path, PathInfo, StopState};
use crate::pathfinder::PathSpecification;
use crate::supply::Supply;


/// Formats minutes after midnight as HH:MM:SS.
pub fn format_time(time_min: f64) -> String {
    let hour = (time_min / 60.0) as i64;
    let min_part = (time_min - hour as f64 * 60.0) as i64;
    let sec_part = ((time_min - time_min.floor()) * 60.0) as i64;
    format!("{:02}:{:02}:{:02}", hour, min_part, sec_part)
}

/// Formats a duration in minutes as H:MM:SS.s.
pub fn format_duration(time_min: f64) -> String {
    let hours = (time_min / 60.0) as i64;
    let minutes = time_min - 60.0 * hours as f64;
    let min_part = minutes.floor();
    let sec_part = (minutes - min_part) * 60.0;
    format!("{:2}:{:02}:{:04.1}", hours, min_part as i64, sec_part)
}


/// The trace sinks of a single `find_path` call: a human-readable log, a labels
/// CSV, and the sampled-pathset file.  All sinks are scoped to the call and
/// released on drop; a disabled context makes every write a no-op, so tracing
/// never changes computed outputs.
pub struct TraceContext<'a> {
    supply: &'a Supply,
    outbound: bool,
    hyperpath: bool,
    log: Option<BufWriter<File>>,
    labels: Option<csv::Writer<File>>,
    pathset: Option<BufWriter<File>>,
    link_num: i32,
}

impl<'a> TraceContext<'a> {
    pub fn disabled(supply: &'a Supply) -> TraceContext<'a> {
        return TraceContext {
            supply,
            outbound: true,
            hyperpath: false,
            log: None,
            labels: None,
            pathset: None,
            link_num: 1,
        };
    }

    pub fn new(supply: &'a Supply, spec: &PathSpecification, output_dir: &FsPath)
               -> std::io::Result<TraceContext<'a>> {
        if !spec.trace {
            let mut ctx = TraceContext::disabled(supply);
            ctx.outbound = spec.outbound;
            ctx.hyperpath = spec.hyperpath;
            return Ok(ctx);
        }

        // trace files accumulate across iterations for the same path id
        let append = spec.iteration != 1;
        let log_file = open_trace_file(
            &output_dir.join(format!("pathfinder_trace_{}.log", spec.path_id)), append)?;
        let labels_file = open_trace_file(
            &output_dir.join(format!("pathfinder_labels_{}.csv", spec.path_id)), append)?;
        let mut labels = csv::Writer::from_writer(labels_file);
        if !append {
            labels.write_record(&["label_iteration", "link", "node ID", "time", "mode",
                                  "trip_id", "link_time", "link_cost", "cost", "AB"])
                .map_err(csv_io_error)?;
        }
        let pathset_file = open_trace_file(&output_dir.join("pathset.txt"), true)?;

        return Ok(TraceContext {
            supply,
            outbound: spec.outbound,
            hyperpath: spec.hyperpath,
            log: Some(BufWriter::new(log_file)),
            labels: Some(labels),
            pathset: Some(BufWriter::new(pathset_file)),
            link_num: 1,
        });
    }

    pub fn enabled(&self) -> bool {
        return self.log.is_some();
    }

    /// Writes one line to the trace log.
    pub fn note(&mut self, line: &str) {
        if let Some(writer) = &mut self.log {
            let _ = writeln!(writer, "{}", line);
        }
    }

    /// The label of a state's mode: the supply mode of the trip for transit
    /// links, the link kind otherwise.
    pub fn mode_label(&self, mode: DepArrMode, trip_id: i32) -> String {
        if mode == DepArrMode::Transit {
            match self.supply.trip_info(trip_id) {
                Some(info) => self.supply.mode_name(info.supply_mode_num),
                None => String::from("???"),
            }
        } else {
            format!("{}", mode)
        }
    }

    fn trip_label(&self, mode: DepArrMode, trip_id: i32) -> String {
        if mode == DepArrMode::Transit {
            self.supply.trip_name(trip_id)
        } else {
            self.supply.mode_name(trip_id)
        }
    }

    pub fn stop_state_header(&self) -> String {
        format!("{:>8}: {:>10}{:>12}{:>22}{:>12}{:>5}{:>5}{:>12}{:>14}{:>13}{:>9}{:>10}",
                "stop",
                if self.outbound { "dep_time" } else { "arr_time" },
                if self.outbound { "dep_mode" } else { "arr_mode" },
                "trip_id",
                if self.outbound { "successor" } else { "predecessor" },
                "seq",
                if self.outbound { "suc" } else { "pred" },
                "linktime", "linkcost", "cost", "iter",
                if self.outbound { "arr_time" } else { "dep_time" })
    }

    pub fn stop_state_line(&self, stop_id: i32, ss: &StopState) -> String {
        let costs = if self.hyperpath {
            format!("{:>12.4}{:>13.4}", ss.link_cost, ss.cost)
        } else {
            format!("  {}  {}", format_duration(ss.link_cost), format_duration(ss.cost))
        };
        format!("{:>8}:   {}  {:>10}  {:>20}  {:>10}  {:>3}  {:>3}  {}  {}  {:>7}  {}",
                self.supply.stop_name(stop_id),
                format_time(ss.deparr_time),
                self.mode_label(ss.deparr_mode, ss.trip_id),
                self.trip_label(ss.deparr_mode, ss.trip_id),
                self.supply.stop_name(ss.stop_succpred),
                ss.seq, ss.seq_succpred,
                format_duration(ss.link_time),
                costs,
                ss.iteration,
                format_time(ss.arrdep_time))
    }

    /// Writes the A and B side rows of an accepted stop state to the labels CSV.
    pub fn accepted_label(&mut self, stop_id: i32, ss: &StopState) {
        if self.labels.is_none() {
            return;
        }
        for o_d in 0..2 {
            let node = if o_d == 0 { stop_id } else { ss.stop_succpred };
            let time = if o_d == 0 { ss.deparr_time } else { ss.arrdep_time };
            let a_side = (self.outbound && o_d == 0) || (!self.outbound && o_d == 1);
            let record = [
                format!("{}", ss.iteration),
                format!("{}", self.link_num),
                self.supply.stop_name(node),
                format!("{}", time),
                self.mode_label(ss.deparr_mode, ss.trip_id),
                self.trip_label(ss.deparr_mode, ss.trip_id),
                format!("{}", ss.link_time),
                format!("{}", ss.link_cost),
                format!("{}", ss.cost),
                String::from(if a_side { "A" } else { "B" }),
            ];
            if let Some(writer) = &mut self.labels {
                let _ = writer.write_record(&record);
            }
        }
        self.link_num += 1;
    }

    /// The compact board-stops/trips/alight-stops form of a path.
    pub fn path_compat(&self, path: &Path) -> String {
        if path.is_empty() {
            return String::from("no_path");
        }
        let mut board_stops = vec![];
        let mut trips = vec![];
        let mut alight_stops = vec![];
        let chronological: Vec<&(i32, StopState)> = if self.outbound {
            path.iter().collect()
        } else {
            path.iter().rev().collect()
        };
        for (stop_id, ss) in chronological {
            if ss.deparr_mode != DepArrMode::Transit {
                continue;
            }
            let (board, alight) = if self.outbound {
                (*stop_id, ss.stop_succpred)
            } else {
                (ss.stop_succpred, *stop_id)
            };
            board_stops.push(self.supply.stop_name(board));
            trips.push(self.supply.trip_name(ss.trip_id));
            alight_stops.push(self.supply.stop_name(alight));
        }
        format!(" {} {} {}", board_stops.iter().join(","), trips.iter().join(","),
                alight_stops.iter().join(","))
    }

    pub fn print_path(&mut self, path: &Path) {
        if !self.enabled() {
            return;
        }
        let header = self.stop_state_header();
        self.note(&header);
        for (stop_id, ss) in path {
            let line = self.stop_state_line(*stop_id, ss);
            self.note(&line);
        }
    }

    /// Appends one reconciled candidate path to the pathset file.
    pub fn pathset_row(&mut self, iteration: i32, passenger_id: i32, path_id: i32,
                       info: &PathInfo, path: &Path) {
        let compat = self.path_compat(path);
        if let Some(writer) = &mut self.pathset {
            let _ = writeln!(writer, "{} {} {} {:8.2} {:8.6}{}",
                             iteration, passenger_id, path_id, info.cost, info.probability,
                             compat);
        }
    }
}

fn open_trace_file(path: &FsPath, append: bool) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).write(true);
    if append {
        options.append(true);
    } else {
        options.truncate(true);
    }
    options.open(path)
}

// csv wraps io errors; unwrap back to io for our error type
fn csv_io_error(err: csv::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err)
}

use std::collections::HashMap;
use std::error::Error;
use std::path::Path;

use ndarray::prelude::*;
use rayon::prelude::*;
use yaml_rust::{Yaml, YamlLoader};

use rust_transit_pathfinder::config_utils;
use rust_transit_pathfinder::{
    Attributes, DepArrMode, PathFinder, PathSpecification, SearchParams, Supply,
};


/// Builds the supply tables from the scenario yaml.  The scenario lists id
/// maps, trips with their stop times, access/egress links, transfer links, and
/// the weight table.
fn supply_from_yaml(yaml_cfg: &Yaml) -> Supply {
    let mut supply = Supply::new();

    for entry in yaml_cfg["stops"].as_vec().expect("no stops") {
        let row = entry.as_vec().expect("bad stop row");
        supply.add_stop_id(row[0].as_i64().unwrap() as i32, row[1].as_str().unwrap());
    }
    for entry in yaml_cfg["modes"].as_vec().expect("no modes") {
        let row = entry.as_vec().expect("bad mode row");
        supply.add_supply_mode(row[0].as_i64().unwrap() as i32, row[1].as_str().unwrap());
    }
    for entry in yaml_cfg["routes"].as_vec().expect("no routes") {
        let row = entry.as_vec().expect("bad route row");
        supply.add_route_id(row[0].as_i64().unwrap() as i32, row[1].as_str().unwrap());
    }

    // trips carry their stop times inline; collect them into the parallel
    // arrays the supply loader expects
    let mut stoptime_index = vec![];
    let mut stoptime_times = vec![];
    for trip in yaml_cfg["trips"].as_vec().expect("no trips") {
        let trip_id = trip["id"].as_i64().expect("trip has no id") as i32;
        let supply_mode = trip["mode"].as_i64().expect("trip has no mode") as i32;
        let route_id = trip["route"].as_i64().expect("trip has no route") as i32;
        if let Some(name) = trip["name"].as_str() {
            supply.add_trip_id(trip_id, name);
        }
        supply.add_trip_info(trip_id, supply_mode, route_id, Attributes::new());

        for (ii, visit) in trip["stops"].as_vec().expect("trip has no stops").iter().
                           enumerate() {
            let visit = visit.as_vec().expect("bad trip stop row");
            stoptime_index.push([trip_id, ii as i32 + 1, visit[0].as_i64().unwrap() as i32]);
            stoptime_times.push([yaml_f64(&visit[1]), yaml_f64(&visit[2])]);
        }
    }
    let num_rows = stoptime_index.len();
    let index = Array2::from_shape_fn((num_rows, 3), |(ii, jj)| stoptime_index[ii][jj]);
    let times = Array2::from_shape_fn((num_rows, 2), |(ii, jj)| stoptime_times[ii][jj]);
    supply.set_stop_times(index.view(), times.view()).expect("bad stop times");

    for entry in yaml_cfg["access"].as_vec().expect("no access links") {
        let row = entry.as_vec().expect("bad access row");
        let mut attrs = Attributes::new();
        attrs.insert(String::from("time_min"), yaml_f64(&row[3]));
        supply.add_access_link(row[0].as_i64().unwrap() as i32,
                               row[1].as_i64().unwrap() as i32,
                               row[2].as_i64().unwrap() as i32, attrs);
    }
    if let Some(transfers) = yaml_cfg["transfers"].as_vec() {
        for entry in transfers {
            let row = entry.as_vec().expect("bad transfer row");
            let mut attrs = Attributes::new();
            attrs.insert(String::from("time_min"), yaml_f64(&row[2]));
            supply.add_transfer_link(row[0].as_i64().unwrap() as i32,
                                     row[1].as_i64().unwrap() as i32, attrs);
        }
    }
    for entry in yaml_cfg["weights"].as_vec().expect("no weights") {
        let row = entry.as_vec().expect("bad weight row");
        let demand_mode_type: DepArrMode = row[1].as_str().unwrap().parse().
            expect("bad demand mode type");
        supply.add_weight(row[0].as_str().unwrap(), demand_mode_type,
                          row[2].as_str().unwrap(), row[3].as_i64().unwrap() as i32,
                          row[4].as_str().unwrap(), yaml_f64(&row[5]));
    }

    return supply;
}

fn yaml_f64(value: &Yaml) -> f64 {
    value.as_f64().or_else(|| value.as_i64().map(|vv| vv as f64)).
        expect("expected a number")
}

// A convenience type for parsing csv data
type Row = HashMap<String, String>;

fn demand_from_csv(csv_path: &Path, iteration: i32)
                   -> Result<Vec<PathSpecification>, Box<dyn Error>> {
    let file = std::fs::File::open(csv_path)?;
    let mut reader = csv::Reader::from_reader(file);
    let mut specs = vec![];
    for result in reader.deserialize() {
        let row: Row = result?;
        specs.push(PathSpecification {
            iteration,
            passenger_id: row["passenger_id"].parse()?,
            path_id: row["path_id"].parse()?,
            hyperpath: row["hyperpath"].parse::<i32>()? != 0,
            user_class: row["user_class"].clone(),
            access_mode: row["access_mode"].clone(),
            transit_mode: row["transit_mode"].clone(),
            egress_mode: row["egress_mode"].clone(),
            origin_taz_id: row["origin_taz"].parse()?,
            destination_taz_id: row["destination_taz"].parse()?,
            outbound: row["outbound"].parse::<i32>()? != 0,
            preferred_time: config_utils::num_minutes_from_time_str(&row["preferred_time"]),
            trace: row["trace"].parse::<i32>()? != 0,
        });
    }
    Ok(specs)
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: {} <scenario.yaml>", args[0]);
        std::process::exit(1);
    }

    let scenario_path = Path::new(&args[1]);
    let file_contents = std::fs::read_to_string(scenario_path).
        expect("Failed to read scenario file!");
    let yaml_cfg = YamlLoader::load_from_str(&file_contents).
        expect("Failed to parse scenario as yaml!");
    let yaml_cfg = &yaml_cfg[0];

    let params = SearchParams::from_yaml(&yaml_cfg["params"]);
    let supply = supply_from_yaml(yaml_cfg);

    let base_dir = scenario_path.parent().unwrap_or_else(|| Path::new("."));
    let output_dir = config_utils::str_to_absolute_path(
        yaml_cfg["output_dir"].as_str().unwrap_or("."), base_dir);
    std::fs::create_dir_all(&output_dir).expect("Failed to create output directory!");
    let finder = PathFinder::new(params, supply, &output_dir);

    let iteration = yaml_cfg["iteration"].as_i64().unwrap_or(1) as i32;
    let demand_path = config_utils::str_to_absolute_path(
        yaml_cfg["demand"].as_str().expect("no demand csv"), base_dir);
    let specs = demand_from_csv(&demand_path, iteration).expect("Failed to parse demand csv!");

    log::info!("assigning {} demand rows", specs.len());
    // the finder is shared read-only; every call owns its own state and random
    // stream, so the rows can be assigned in parallel
    let results: Vec<String> = specs.par_iter().map(|spec| {
        match finder.find_path(spec) {
            Ok(result) if result.path_found() => format!(
                "path_id {:6}  cost {:8.3}  links {:3}  label iters {:5}  ms {}+{}",
                spec.path_id, result.total_cost, result.states.len(),
                result.perf.label_iterations, result.perf.milliseconds_labeling,
                result.perf.milliseconds_enumerating),
            Ok(_) => format!("path_id {:6}  no path found", spec.path_id),
            Err(err) => format!("path_id {:6}  failed: {}", spec.path_id, err),
        }
    }).collect();

    for line in results {
        println!("{}", line);
    }
}

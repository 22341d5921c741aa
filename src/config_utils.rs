use std::path::Path;
use std::path::PathBuf;


pub fn str_to_absolute_path(path_str: &str, default_base_dir: &Path) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        return path;
    } else {
        return [default_base_dir, Path::new(&path)].iter().collect();
    }
}

/// Parses "HH:MM" or "HH:MM:SS" into minutes after midnight.
pub fn num_minutes_from_time_str(timestr: &str) -> f64 {
    let parts: Vec<&str> = timestr.split(":").collect();
    let hours: f64 = parts[0].parse().unwrap();
    let minutes: f64 = parts[1].parse().unwrap();
    let seconds: f64 = if parts.len() > 2 { parts[2].parse().unwrap() } else { 0.0 };
    hours * 60.0 + minutes + seconds / 60.0
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_str_parsing() {
        assert_eq!(num_minutes_from_time_str("08:00"), 480.0);
        assert_eq!(num_minutes_from_time_str("00:30"), 30.0);
        assert_eq!(num_minutes_from_time_str("08:10:30"), 490.5);
    }
}

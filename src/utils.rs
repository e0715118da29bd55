pub fn ts_hm() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

pub fn interval_secs(secs: u64) -> tokio::time::Interval {
    tokio::time::interval(std::time::Duration::from_secs(secs))
}

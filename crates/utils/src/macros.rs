/// convert a unix timestamp (seconds) to local time(String)
#[macro_export]
macro_rules! local_time {
    ($secs:expr) => {
        chrono::DateTime::from_timestamp($secs, 0)
            .map(|t| t.with_timezone(&chrono::Local).naive_local().to_string())
            .unwrap_or_else(|| $secs.to_string())
    };
}

#[test]
fn test_local_time() {
    let s = local_time!(0i64);
    assert!(s.starts_with("1970-01-01") || s.starts_with("1969-12-31"));
}

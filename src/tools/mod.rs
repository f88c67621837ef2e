use self::error::{DtnError, Result};
use std::time::SystemTime;

/// Handle errors
pub mod error;

/// Seconds between the UNIX epoch and the DTN epoch (2000-01-01T00:00:00Z).
pub const DTN_EPOCH_OFFSET: u64 = 946684800;

/// Convert a `SystemTime` into seconds since the DTN epoch.
pub fn system_time_to_dtn(time: &SystemTime) -> Result<u64> {
    let duration = time
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|_| DtnError::new("Fail to get UNIX time"))?;
    let seconds_utc = duration.as_secs();
    if seconds_utc < DTN_EPOCH_OFFSET {
        return Err(DtnError::new("System clock is before the DTN epoch"));
    }
    Ok(seconds_utc - DTN_EPOCH_OFFSET)
}

/// Current time as seconds since the DTN epoch.
pub fn dtn_time_now() -> u64 {
    system_time_to_dtn(&SystemTime::now()).map_or(0, |t| t)
}

/// UTC rendering of a DTN-epoch timestamp, for logs and operators.
pub fn dtn_time_to_utc(dtn_secs: u64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp((dtn_secs + DTN_EPOCH_OFFSET) as i64, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    #[test]
    pub fn test_dtn_epoch() {
        let t = std::time::UNIX_EPOCH + std::time::Duration::from_secs(super::DTN_EPOCH_OFFSET);
        assert_eq!(super::system_time_to_dtn(&t).unwrap(), 0);
        let t = t + std::time::Duration::from_secs(86400);
        assert_eq!(super::system_time_to_dtn(&t).unwrap(), 86400);
    }

    #[test]
    pub fn test_dtn_time_rendering() {
        let rendered = super::dtn_time_to_utc(0).to_rfc3339();
        assert!(rendered.starts_with("2000-01-01T00:00:00"));
    }
}

//! Durable per-bucket settings
//!
//! Each bucket directory holds a `settings.json`. Saves go through the
//! replace-with-backup writer, so a crash leaves `settings.json`,
//! `settings.json.new`, `settings.json.old`, or some combination behind, but
//! never a torn `settings.json`. Loads only ever read `settings.json`.
//!
//! Nothing here serializes concurrent saves; callers hold a per-bucket lock.

use crate::atomic_writer::AtomicWriter;
use crate::traits::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const SETTINGS_FILE: &str = "settings.json";

/// Highest partition count addressable by a 16-bit vbucket id
pub const MAX_PARTITIONS: u32 = 1 << 16;

/// Longest duration a settings file can hold, in signed 64-bit nanoseconds
pub const MAX_DURATION: Duration = Duration::from_nanos(i64::MAX as u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BucketSettings {
    /// Fixed for the lifetime of the bucket directory
    pub num_partitions: u32,

    /// Empty for a plain-text secret in `password_hash`, or `sha256`
    pub password_hash_func: String,

    pub password_hash: String,

    pub password_salt: String,

    #[serde(with = "duration_nanos")]
    pub sleep_interval: Duration,

    #[serde(with = "duration_nanos")]
    pub purge_timeout: Duration,
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self {
            num_partitions: 1,
            password_hash_func: String::new(),
            password_hash: String::new(),
            password_salt: String::new(),
            sleep_interval: Duration::from_secs(100),
            purge_timeout: Duration::from_secs(10),
        }
    }
}

impl BucketSettings {
    /// Load `settings.json` from a bucket directory
    ///
    /// A missing file is the new-bucket case and yields `Ok(None)`. Any other
    /// read failure, a decode failure, or an out-of-range partition count is
    /// an error.
    pub fn load(bucket_dir: &Path) -> StorageResult<Option<Self>> {
        let path = bucket_dir.join(SETTINGS_FILE);
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let settings: BucketSettings = serde_json::from_slice(&content).map_err(|e| {
            StorageError::Serialization(format!("{}: {}", path.display(), e))
        })?;
        settings.validate()?;

        Ok(Some(settings))
    }

    /// Persist to `settings.json` in a bucket directory
    pub fn save(&self, bucket_dir: &Path) -> StorageResult<()> {
        self.validate()?;
        let content = serde_json::to_vec(self)
            .map_err(|e| StorageError::Serialization(format!("JSON serialize error: {}", e)))?;

        let mut writer = AtomicWriter::new(bucket_dir.join(SETTINGS_FILE))?;
        writer.write(&content)?;
        writer.commit()
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.num_partitions == 0 || self.num_partitions > MAX_PARTITIONS {
            return Err(StorageError::InvalidData(format!(
                "numPartitions must be in 1..={}, got {}",
                MAX_PARTITIONS, self.num_partitions
            )));
        }
        for (name, value) in [
            ("sleepInterval", self.sleep_interval),
            ("purgeTimeout", self.purge_timeout),
        ] {
            if value > MAX_DURATION {
                return Err(StorageError::InvalidData(format!(
                    "{} must be at most {:?}, got {:?}",
                    name, MAX_DURATION, value
                )));
            }
        }
        Ok(())
    }
}

/// Durations as integer nanoseconds
mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _, ser::Error as _};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        let nanos = i64::try_from(d.as_nanos()).map_err(S::Error::custom)?;
        s.serialize_i64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = i64::deserialize(d)?;
        if nanos < 0 {
            return Err(D::Error::custom(format!("negative duration: {}", nanos)));
        }
        Ok(Duration::from_nanos(nanos as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sample() -> BucketSettings {
        BucketSettings {
            num_partitions: 1024,
            password_hash_func: "sha256".to_string(),
            password_hash: "abcd".to_string(),
            password_salt: "00ff".to_string(),
            sleep_interval: Duration::from_millis(1500),
            purge_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_load_missing_is_not_an_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(BucketSettings::load(temp_dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let settings = sample();
        settings.save(temp_dir.path()).unwrap();

        let loaded = BucketSettings::load(temp_dir.path()).unwrap().unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["numPartitions"], 1024);
        assert_eq!(json["passwordHashFunc"], "sha256");
        assert_eq!(json["passwordSalt"], "00ff");
        assert_eq!(json["sleepInterval"], 1_500_000_000u64);
        assert_eq!(json["purgeTimeout"], 10_000_000_000u64);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join(SETTINGS_FILE),
            br#"{"numPartitions": 8, "someFutureField": true}"#,
        )
        .unwrap();

        let loaded = BucketSettings::load(temp_dir.path()).unwrap().unwrap();
        assert_eq!(loaded.num_partitions, 8);
        assert_eq!(loaded.purge_timeout, BucketSettings::default().purge_timeout);
    }

    #[test]
    fn test_second_save_keeps_backup() {
        let temp_dir = TempDir::new().unwrap();
        let first = sample();
        first.save(temp_dir.path()).unwrap();

        let mut second = first.clone();
        second.password_hash = "changed".to_string();
        second.save(temp_dir.path()).unwrap();

        let loaded = BucketSettings::load(temp_dir.path()).unwrap().unwrap();
        assert_eq!(loaded.password_hash, "changed");

        let backup = fs::read(temp_dir.path().join("settings.json.old")).unwrap();
        let backup: BucketSettings = serde_json::from_slice(&backup).unwrap();
        assert_eq!(backup, first);
    }

    #[test]
    fn test_interrupted_save_keeps_committed_record() {
        let temp_dir = TempDir::new().unwrap();
        let committed = sample();
        committed.save(temp_dir.path()).unwrap();

        // Crash after the `.new` write, before any rename
        fs::write(
            temp_dir.path().join("settings.json.new"),
            br#"{"numPartitions": 4, "passwo"#,
        )
        .unwrap();

        let loaded = BucketSettings::load(temp_dir.path()).unwrap().unwrap();
        assert_eq!(loaded, committed);
    }

    #[test]
    fn test_torn_file_fails_cleanly() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join(SETTINGS_FILE),
            br#"{"numPartitions": 4, "passwo"#,
        )
        .unwrap();

        let err = BucketSettings::load(temp_dir.path()).unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
    }

    #[test]
    fn test_zero_partitions_rejected() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join(SETTINGS_FILE),
            br#"{"numPartitions": 0}"#,
        )
        .unwrap();
        assert!(BucketSettings::load(temp_dir.path()).is_err());

        let settings = BucketSettings {
            num_partitions: 0,
            ..Default::default()
        };
        assert!(settings.save(temp_dir.path()).is_err());
    }

    #[test]
    fn test_longest_duration_survives_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let settings = BucketSettings {
            sleep_interval: MAX_DURATION,
            purge_timeout: MAX_DURATION,
            ..Default::default()
        };
        settings.save(temp_dir.path()).unwrap();

        let loaded = BucketSettings::load(temp_dir.path()).unwrap().unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_unloadable_duration_is_not_saved() {
        let temp_dir = TempDir::new().unwrap();
        let settings = BucketSettings {
            sleep_interval: MAX_DURATION + Duration::from_nanos(1),
            ..Default::default()
        };
        let err = settings.save(temp_dir.path()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidData(_)));
        assert!(!temp_dir.path().join(SETTINGS_FILE).exists());

        let settings = BucketSettings {
            purge_timeout: Duration::from_nanos(u64::MAX),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
        assert!(serde_json::to_vec(&settings).is_err());
    }

    #[test]
    fn test_negative_duration_rejected() {
        let err = serde_json::from_str::<BucketSettings>(r#"{"sleepInterval": -1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_copy_is_independent() {
        let live = sample();
        let mut copy = live.clone();
        copy.password_salt.push_str("99");
        assert_eq!(live.password_salt, "00ff");
    }
}

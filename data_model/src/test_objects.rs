pub mod tests {
    use std::path::PathBuf;

    use crate::{
        BackupRequest,
        ContentDigest,
        ContentLocation,
        CopyId,
        CopyKind,
        MountSpec,
        Retention,
        ScenarioContext,
        StorageCopy,
        StorageCopyBuilder,
    };

    pub const TEST_POLICY: &str = "test_sp";
    pub const TEST_PRIMARY_COPY: &str = "Snap1";
    pub const TEST_ARRAY: &str = "array_a";
    pub const TEST_ARRAY_2: &str = "array_b";
    pub const TEST_ARRAY_3: &str = "array_c";
    pub const TEST_MOUNT_HOST: &str = "proxy_ma";
    pub const TEST_CONTENT_PATH: &str = "/data/testdata";
    pub const TEST_MOUNT_PATH: &str = "/mnt/snaps";

    pub fn test_arrays() -> Vec<String> {
        vec![
            TEST_ARRAY.to_string(),
            TEST_ARRAY_2.to_string(),
            TEST_ARRAY_3.to_string(),
        ]
    }

    pub fn mock_copy(name: &str, kind: CopyKind, source: Option<&str>) -> StorageCopy {
        StorageCopyBuilder::default()
            .id(CopyId::new(0))
            .policy(TEST_POLICY.to_string())
            .name(name.to_string())
            .kind(kind)
            .source_copy(source.map(|s| s.to_string()))
            .retention(Retention::default())
            .array_name(TEST_ARRAY.to_string())
            .build()
            .unwrap()
    }

    pub fn mock_mount_spec() -> MountSpec {
        MountSpec {
            host: TEST_MOUNT_HOST.to_string(),
            mount_path: PathBuf::from(TEST_MOUNT_PATH),
            vss_protection: true,
        }
    }

    pub fn mock_content_location() -> ContentLocation {
        ContentLocation::new(TEST_MOUNT_HOST, TEST_CONTENT_PATH)
    }

    pub fn mock_backup_request() -> BackupRequest {
        BackupRequest::default()
    }

    pub fn mock_content() -> ContentDigest {
        [
            ("dir1/file1.txt".to_string(), "9a0364b9e99bb480dd25e1f0284c8555".to_string()),
            ("dir1/file2.txt".to_string(), "b026324c6904b2a9cb4b88d6d61c81d1".to_string()),
            ("file3.bin".to_string(), "26ab0db90d72e28ad0ba1e22ee510510".to_string()),
        ]
        .into_iter()
        .collect()
    }

    pub fn mock_scenario() -> ScenarioContext {
        ScenarioContext::new("test_scenario", TEST_POLICY, TEST_PRIMARY_COPY)
    }
}

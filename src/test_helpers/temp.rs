use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Test context with temporary directory management.
/// Automatically cleans up when dropped.
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a new test context with a fresh temporary directory
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    /// Get the root path of the temporary directory
    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Create a file with content at the given relative path
    pub fn create_file(&self, relative_path: &str, content: &str) -> PathBuf {
        self.create_file_bytes(relative_path, content.as_bytes())
    }

    /// Create a file with binary content at the given relative path
    pub fn create_file_bytes(&self, relative_path: &str, content: &[u8]) -> PathBuf {
        let path = self.root().join(relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dirs");
        }
        fs::write(&path, content).expect("Failed to write file");
        path
    }

    /// Create an empty file (touch)
    pub fn touch(&self, relative_path: &str) -> PathBuf {
        self.create_file(relative_path, "")
    }

    /// Create a directory at the given relative path
    pub fn create_dir(&self, relative_path: &str) -> PathBuf {
        let path = self.root().join(relative_path);
        fs::create_dir_all(&path).expect("Failed to create dir");
        path
    }

    /// Create a zip archive. Entry names ending in `/` become directories.
    pub fn create_zip(&self, relative_path: &str, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = self.root().join(relative_path);
        let file = fs::File::create(&path).expect("Failed to create zip");
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();

        for (name, content) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).expect("Failed to add dir");
            } else {
                writer.start_file(*name, options).expect("Failed to start file");
                writer.write_all(content).expect("Failed to write entry");
            }
        }
        writer.finish().expect("Failed to finish zip");
        path
    }

    /// Create a mock release tree with a firmware image per device name
    pub fn create_mock_release(&self, version: &str, devices: &[&str]) -> PathBuf {
        let root = self.create_dir(version);
        for device in devices {
            self.create_file(
                &format!("{}/maixpy_{}/kboot.kfpkg", version, device),
                &format!("kfpkg for {}", device),
            );
        }
        root
    }

    /// Get full path for a relative path
    pub fn path(&self, relative: &str) -> PathBuf {
        self.root().join(relative)
    }

    /// Check if a relative path exists
    pub fn exists(&self, relative: &str) -> bool {
        self.path(relative).exists()
    }

    /// Read file content at relative path
    pub fn read_file(&self, relative: &str) -> String {
        fs::read_to_string(self.path(relative)).expect("Failed to read file")
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

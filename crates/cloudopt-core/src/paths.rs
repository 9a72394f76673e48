use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const CLOUDOPT_DIR: &str = ".cloudopt";
pub const CONFIG_FILE: &str = ".cloudopt/config.yaml";
pub const DB_FILE: &str = ".cloudopt/cloudopt.db";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn cloudopt_dir(root: &Path) -> PathBuf {
    root.join(CLOUDOPT_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn db_path(root: &Path) -> PathBuf {
    root.join(DB_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/acct");
        assert_eq!(
            config_path(root),
            PathBuf::from("/tmp/acct/.cloudopt/config.yaml")
        );
        assert_eq!(db_path(root), PathBuf::from("/tmp/acct/.cloudopt/cloudopt.db"));
    }
}

//! Virtual-to-backend path translation

use std::path::{Component, Path, PathBuf};

/// Maps virtual paths handed over by the mount driver onto backend paths
/// under a fixed root.
///
/// Both `\` and `/` are accepted as separators, `.` components are dropped
/// and `..` never climbs above the root.
#[derive(Debug, Clone)]
pub struct PathTranslator {
    root: PathBuf,
}

impl PathTranslator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalize a virtual path to an absolute, root-relative form
    /// (`/a/b`), without joining the backend root.
    pub fn normalize(virtual_path: &Path) -> PathBuf {
        let raw = virtual_path.to_string_lossy();
        let mut parts: Vec<&str> = Vec::new();

        for part in raw.split(['/', '\\']) {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                other => parts.push(other),
            }
        }

        let mut out = PathBuf::from("/");
        out.extend(parts);
        out
    }

    /// Join a virtual path onto the root
    pub fn translate(&self, virtual_path: &Path) -> PathBuf {
        let normalized = Self::normalize(virtual_path);
        let mut out = self.root.clone();
        for component in normalized.components() {
            if let Component::Normal(part) = component {
                out.push(part);
            }
        }
        out
    }

    /// Same as [`translate`](Self::translate), always `/`-separated.
    ///
    /// Remote sessions expect POSIX paths whatever the host platform.
    pub fn translate_str(&self, virtual_path: &Path) -> String {
        let translated = self.translate(virtual_path);
        let joined = translated.to_string_lossy().replace('\\', "/");
        if joined.is_empty() {
            "/".to_string()
        } else {
            joined
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_joins_root() {
        let t = PathTranslator::new("/srv/data");
        assert_eq!(t.translate(Path::new("/a/b.txt")), PathBuf::from("/srv/data/a/b.txt"));
        assert_eq!(t.translate(Path::new("/")), PathBuf::from("/srv/data"));
    }

    #[test]
    fn test_translate_mixed_separators() {
        let t = PathTranslator::new("/srv/data");
        assert_eq!(
            t.translate_str(Path::new("\\docs\\report.pdf")),
            "/srv/data/docs/report.pdf"
        );
        assert_eq!(t.translate_str(Path::new("./docs/./x")), "/srv/data/docs/x");
    }

    #[test]
    fn test_dotdot_is_clamped_at_root() {
        let t = PathTranslator::new("/srv/data");
        assert_eq!(
            t.translate(Path::new("/../../etc/passwd")),
            PathBuf::from("/srv/data/etc/passwd")
        );
        assert_eq!(t.translate(Path::new("/a/../b")), PathBuf::from("/srv/data/b"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(PathTranslator::normalize(Path::new("")), PathBuf::from("/"));
        assert_eq!(
            PathTranslator::normalize(Path::new("a//b/")),
            PathBuf::from("/a/b")
        );
    }
}

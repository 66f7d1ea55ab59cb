use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::filter::PathFilter;

/// Walk every include root and collect image files the filter admits.
///
/// Excluded directories are pruned rather than walked. Roots that do not
/// exist are returned separately so the caller can warn about them.
pub fn discover_images(filter: &PathFilter, extensions: &[String]) -> (BTreeSet<PathBuf>, Vec<PathBuf>) {
    let mut images = BTreeSet::new();
    let mut missing_roots = Vec::new();

    for root in filter.include_roots() {
        if !root.exists() {
            missing_roots.push(root.clone());
            continue;
        }

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !(e.file_type().is_dir() && filter.is_excluded(e.path())));

        for entry in walker.filter_map(|e| e.ok()) {
            let path = entry.path();
            if entry.file_type().is_file() && has_image_extension(path, extensions) && !filter.is_excluded(path) {
                images.insert(path.to_path_buf());
            }
        }
    }

    (images, missing_roots)
}

fn has_image_extension(path: &Path, extensions: &[String]) -> bool {
    match path.extension() {
        Some(ext) => {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            extensions
                .iter()
                .any(|e| e.trim_start_matches('.').to_lowercase() == ext_lower)
        }
        None => false,
    }
}

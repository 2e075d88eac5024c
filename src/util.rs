use std::path::{Component, Path, PathBuf};

/// Resolve `relative` below `root`, matching each existing component without regard to case.
///
/// Components that do not exist are appended as given. Returns `None` when `relative` is
/// absolute or tries to climb out of `root`.
pub fn find_case_insensitive_path<P1: AsRef<Path>, P2: AsRef<Path>>(root: P1, relative: P2) -> Option<PathBuf> {
    let root = root.as_ref();
    let relative = relative.as_ref();

    let mut result = PathBuf::new();
    let mut path_exists = true;
    for component in relative.components() {
        let component = match component {
            Component::Normal(c) => c,
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        };

        if !path_exists {
            result.push(component);
            continue;
        }

        let found = root.join(&result).read_dir().ok().and_then(|entries| {
            entries.filter_map(Result::ok).map(|entry| entry.file_name()).find(|file_name| {
                unicase::eq(&file_name.to_string_lossy(), &component.to_string_lossy())
            })
        });

        if let Some(file_name) = found {
            result.push(file_name);
        } else {
            path_exists = false;
            result.push(component);
        }
    }

    Some(result)
}

use std::path::PathBuf;
use which::which;

pub fn is_available(program: &str) -> bool {
    resolve(program).is_some()
}

pub fn resolve(program: &str) -> Option<PathBuf> {
    match which(program) {
        Ok(path) => {
            tracing::debug!("Found {}: {:?}", program, path);
            Some(path)
        }
        Err(_) => None,
    }
}

/// Programs from `programs` not found on PATH, sorted and deduplicated.
pub fn missing_tools<'a>(programs: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut missing: Vec<String> = programs
        .into_iter()
        .filter(|program| !is_available(program))
        .map(str::to_string)
        .collect();
    missing.sort();
    missing.dedup();
    missing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_is_available() {
        assert!(is_available("sh"));
    }

    #[test]
    fn reports_missing_once() {
        let missing = missing_tools(["sh", "shadowmap-nope", "shadowmap-nope"]);
        assert_eq!(missing, vec!["shadowmap-nope"]);
    }
}

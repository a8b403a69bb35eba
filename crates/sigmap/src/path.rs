//! Path helpers
//!
//! Paths travel as component vectors in fcalls and as normalized
//! `/a/b` strings wherever they key a table (fences, listings in logs).

/// Split a path into its non-empty components
pub fn split(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .map(str::to_string)
        .collect()
}

/// Render components as a normalized absolute path
pub fn join(components: &[String]) -> String {
    if components.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for c in components {
        out.push('/');
        out.push_str(c);
    }
    out
}

/// Leading slash, no trailing slash, root is `/`
pub fn normalize(path: &str) -> String {
    join(&split(path))
}

pub fn parent(path: &str) -> String {
    let mut comps = split(path);
    comps.pop();
    join(&comps)
}

pub fn filename(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

/// Whether `ancestor` names `path` itself or a directory above it
pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
    let a = split(ancestor);
    let p = split(path);
    a.len() <= p.len() && a.iter().zip(p.iter()).all(|(x, y)| x == y)
}

/// Apply `..` and plain names to a starting component list
pub fn resolve(base: &[String], names: &[String]) -> Vec<String> {
    let mut out = base.to_vec();
    for n in names {
        match n.as_str() {
            ".." => {
                out.pop();
            }
            "." | "" => {}
            _ => out.push(n.clone()),
        }
    }
    out
}

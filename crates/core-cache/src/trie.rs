//! Longest-prefix path matching for directory redirects.
//!
//! A job records its outputs against sandbox paths; the client's redirect
//! table maps sandbox directories to real ones. Restoration rewrites each
//! recorded path through the deepest matching prefix.

use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
pub struct PathTrie {
    children: BTreeMap<String, PathTrie>,
    value: Option<String>,
}

impl PathTrie {
    pub fn new() -> Self {
        Self::default()
    }

    fn components(path: &str) -> impl Iterator<Item = &str> {
        path.split('/').filter(|c| !c.is_empty() && *c != ".")
    }

    pub fn insert(&mut self, prefix: &str, target: &str) {
        let mut node = self;
        for comp in Self::components(prefix) {
            node = node.children.entry(comp.to_string()).or_default();
        }
        node.value = Some(target.to_string());
    }

    /// Deepest stored prefix of `path`, returning `(target, rest)`.
    pub fn find_max<'a>(&self, path: &'a str) -> Option<(&str, Vec<&'a str>)> {
        let comps: Vec<&str> = Self::components(path).collect();
        let mut node = self;
        let mut best: Option<(&str, usize)> = None;
        for (i, comp) in comps.iter().enumerate() {
            match node.children.get(*comp) {
                Some(next) => {
                    node = next;
                    if let Some(v) = &node.value {
                        best = Some((v, i + 1));
                    }
                }
                None => break,
            }
        }
        best.map(|(v, depth)| (v, comps[depth..].to_vec()))
    }

    /// Rewrite `path` through the deepest redirect, or prefix it with `./`
    /// when nothing matches (workspace-relative restore).
    pub fn redirect(&self, path: &str) -> String {
        match self.find_max(path) {
            Some((target, rest)) => {
                let mut out = target.to_string();
                for comp in rest {
                    if !out.is_empty() && !out.ends_with('/') {
                        out.push('/');
                    }
                    out.push_str(comp);
                }
                out
            }
            None => format!("./{path}"),
        }
    }

    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let mut t = Self::new();
        for (k, v) in map {
            t.insert(k, v);
        }
        t
    }
}

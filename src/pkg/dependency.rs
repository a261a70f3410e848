// Purpose: A resolved dependency edge and the ordered name-keyed map that holds them.
// Inputs/Outputs: Built by the resolver and the manifest/lock readers; consumed by update and graph.
// Invariants: Map keys equal `Dependency::name`; iteration follows insertion order.
// Gotchas: Replacing an existing key keeps its original position.

use indexmap::IndexMap;
use indexmap::map::{Iter, Keys, Values};

use crate::pkg::source::Source;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub full_name: String,
    pub version: String,
    pub sum: Option<String>,
    pub source: Source,
}

impl Dependency {
    pub fn new(name: impl Into<String>, version: impl Into<String>, source: Source) -> Self {
        let name = name.into();
        let version = version.into();
        Self {
            full_name: full_name(&name, &version),
            name,
            version,
            sum: None,
            source,
        }
    }

    pub fn with_sum(mut self, sum: Option<String>) -> Self {
        self.sum = sum;
        self
    }

    /// Move to `version`, keeping `full_name` and any pinned source tag in step.
    pub fn advance_to(&mut self, other: &Dependency) {
        self.version = other.version.clone();
        self.full_name = full_name(&self.name, &self.version);
        self.source = other.source.clone();
        if other.sum.is_some() {
            self.sum = other.sum.clone();
        }
    }
}

pub fn full_name(name: &str, version: &str) -> String {
    if version.is_empty() {
        name.to_string()
    } else {
        format!("{name}_{version}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyMap {
    deps: IndexMap<String, Dependency>,
}

impl DependencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Dependency> {
        self.deps.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Dependency> {
        self.deps.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.deps.contains_key(name)
    }

    /// Insert or replace by name; returns the previous entry.
    pub fn insert(&mut self, dep: Dependency) -> Option<Dependency> {
        self.deps.insert(dep.name.clone(), dep)
    }

    pub fn keys(&self) -> Keys<'_, String, Dependency> {
        self.deps.keys()
    }

    pub fn values(&self) -> Values<'_, String, Dependency> {
        self.deps.values()
    }

    pub fn iter(&self) -> Iter<'_, String, Dependency> {
        self.deps.iter()
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }
}

impl<'a> IntoIterator for &'a DependencyMap {
    type Item = (&'a String, &'a Dependency);
    type IntoIter = Iter<'a, String, Dependency>;

    fn into_iter(self) -> Self::IntoIter {
        self.deps.iter()
    }
}

impl FromIterator<Dependency> for DependencyMap {
    fn from_iter<T: IntoIterator<Item = Dependency>>(iter: T) -> Self {
        let mut map = DependencyMap::new();
        for dep in iter {
            map.insert(dep);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::{Dependency, DependencyMap};
    use crate::pkg::source::Source;

    fn oci(name: &str, tag: &str) -> Dependency {
        let src =
            Source::parse(&format!("oci://ghcr.io/kcl-lang/{name}?tag={tag}")).expect("source");
        Dependency::new(name, tag, src)
    }

    #[test]
    fn map_keeps_insertion_order_across_replacement() {
        let mut map: DependencyMap = [
            oci("k8s", "1.28"),
            oci("helloworld", "0.1.0"),
            oci("konfig", "0.4.0"),
        ]
        .into_iter()
        .collect();
        let prev = map.insert(oci("helloworld", "0.1.1"));
        assert_eq!(prev.map(|d| d.version), Some("0.1.0".to_string()));

        let names: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(names, ["k8s", "helloworld", "konfig"]);
        assert_eq!(map.get("helloworld").map(|d| d.full_name.as_str()), Some("helloworld_0.1.1"));
    }

    #[test]
    fn advance_updates_version_full_name_and_source() {
        let mut dep = oci("dep-b", "1.0.0");
        dep.sum = Some("old".into());
        dep.advance_to(&oci("dep-b", "2.0.0"));
        assert_eq!(dep.version, "2.0.0");
        assert_eq!(dep.full_name, "dep-b_2.0.0");
        assert_eq!(dep.source.to_display_string(), "oci://ghcr.io/kcl-lang/dep-b?tag=2.0.0");
        assert_eq!(dep.sum.as_deref(), Some("old"), "absent sum keeps the recorded one");
    }
}

//! Typed resource vectors.
//!
//! A resource vector maps resource names to values that are scalars,
//! sets of disjoint integer ranges, or sets of strings. The algebra is
//! component-wise; subtraction saturates at zero so accounting never goes
//! negative.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Add, AddAssign, Sub, SubAssign};

use log::warn;

const EPSILON: f64 = 1e-9;

pub const CPUS: &str = "cpus";
pub const MEM: &str = "mem";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A non-negative quantity, e.g. CPUs.
    Scalar(f64),
    /// Disjoint closed integer intervals, e.g. port ranges.
    Ranges(Vec<(u64, u64)>),
    /// A set of strings, e.g. disk identifiers.
    Set(BTreeSet<String>),
}

impl Value {
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Scalar(value) => *value <= EPSILON,
            Value::Ranges(ranges) => ranges.is_empty(),
            Value::Set(items) => items.is_empty(),
        }
    }

    fn add(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => Value::Scalar(a + b),
            (Value::Ranges(a), Value::Ranges(b)) => {
                let mut ranges = a.clone();
                ranges.extend(b.iter().copied());
                Value::Ranges(normalize_ranges(ranges))
            }
            (Value::Set(a), Value::Set(b)) => Value::Set(a.union(b).cloned().collect()),
            (a, b) => {
                warn!("cannot add resource values of different kinds: {a:?} and {b:?}");
                a.clone()
            }
        }
    }

    fn subtract(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => Value::Scalar((a - b).max(0.0)),
            (Value::Ranges(a), Value::Ranges(b)) => Value::Ranges(subtract_ranges(a, b)),
            (Value::Set(a), Value::Set(b)) => Value::Set(a.difference(b).cloned().collect()),
            (a, b) => {
                warn!("cannot subtract resource values of different kinds: {a:?} and {b:?}");
                a.clone()
            }
        }
    }

    fn contains(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => *b <= *a + EPSILON,
            (Value::Ranges(a), Value::Ranges(b)) => ranges_contain(a, b),
            (Value::Set(a), Value::Set(b)) => b.is_subset(a),
            _ => false,
        }
    }

    fn intersect(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => Value::Scalar(a.min(*b)),
            (Value::Ranges(a), Value::Ranges(b)) => Value::Ranges(intersect_ranges(a, b)),
            (Value::Set(a), Value::Set(b)) => Value::Set(a.intersection(b).cloned().collect()),
            (a, b) => {
                warn!("cannot intersect resource values of different kinds: {a:?} and {b:?}");
                Value::Scalar(0.0)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resources {
    values: BTreeMap<String, Value>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    /// A convenience constructor for the two resources every worker
    /// advertises.
    pub fn cpus_mem(cpus: f64, mem_mib: f64) -> Self {
        Self::new()
            .with_scalar(CPUS, cpus)
            .with_scalar(MEM, mem_mib)
    }

    pub fn with_scalar(mut self, name: &str, value: f64) -> Self {
        self.values.insert(name.to_string(), Value::Scalar(value));
        self
    }

    pub fn with_ranges(mut self, name: &str, ranges: Vec<(u64, u64)>) -> Self {
        self.values
            .insert(name.to_string(), Value::Ranges(normalize_ranges(ranges)));
        self
    }

    pub fn with_set<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        name: &str,
        items: I,
    ) -> Self {
        self.values.insert(
            name.to_string(),
            Value::Set(items.into_iter().map(Into::into).collect()),
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn scalar(&self, name: &str) -> f64 {
        match self.values.get(name) {
            Some(Value::Scalar(value)) => *value,
            _ => 0.0,
        }
    }

    pub fn cpus(&self) -> f64 {
        self.scalar(CPUS)
    }

    pub fn mem_mib(&self) -> f64 {
        self.scalar(MEM)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn is_empty(&self) -> bool {
        self.values.values().all(Value::is_empty)
    }

    /// Whether every component of `other` fits within this vector.
    pub fn contains(&self, other: &Resources) -> bool {
        other.values.iter().all(|(name, value)| {
            if value.is_empty() {
                return true;
            }
            match self.values.get(name) {
                Some(mine) => mine.contains(value),
                None => false,
            }
        })
    }

    pub fn intersect(&self, other: &Resources) -> Resources {
        let mut values = BTreeMap::new();
        for (name, value) in &self.values {
            if let Some(theirs) = other.values.get(name) {
                let intersection = value.intersect(theirs);
                if !intersection.is_empty() {
                    values.insert(name.clone(), intersection);
                }
            }
        }
        Resources { values }
    }

    fn prune(&mut self) {
        self.values.retain(|_, value| !value.is_empty());
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, other: Resources) -> Resources {
        let mut out = self;
        out += other;
        out
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, other: Resources) {
        for (name, value) in other.values {
            match self.values.get(&name) {
                Some(mine) => {
                    let sum = mine.add(&value);
                    self.values.insert(name, sum);
                }
                None => {
                    self.values.insert(name, value);
                }
            }
        }
        self.prune();
    }
}

impl AddAssign<&Resources> for Resources {
    fn add_assign(&mut self, other: &Resources) {
        *self += other.clone();
    }
}

impl Sub for Resources {
    type Output = Resources;

    fn sub(self, other: Resources) -> Resources {
        let mut out = self;
        out -= other;
        out
    }
}

impl SubAssign for Resources {
    fn sub_assign(&mut self, other: Resources) {
        for (name, value) in other.values {
            if let Some(mine) = self.values.get(&name) {
                let difference = mine.subtract(&value);
                self.values.insert(name, difference);
            }
        }
        self.prune();
    }
}

impl SubAssign<&Resources> for Resources {
    fn sub_assign(&mut self, other: &Resources) {
        *self -= other.clone();
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (name, value) in &self.values {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            match value {
                Value::Scalar(scalar) => write!(f, "{name}:{scalar}")?,
                Value::Ranges(ranges) => {
                    write!(f, "{name}:[")?;
                    for (i, (begin, end)) in ranges.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{begin}-{end}")?;
                    }
                    write!(f, "]")?;
                }
                Value::Set(items) => {
                    write!(f, "{name}:{{")?;
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{item}")?;
                    }
                    write!(f, "}}")?;
                }
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// Sort and merge overlapping or adjacent closed intervals.
fn normalize_ranges(mut ranges: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    ranges.retain(|(begin, end)| begin <= end);
    ranges.sort_unstable();
    let mut out: Vec<(u64, u64)> = vec![];
    for (begin, end) in ranges {
        match out.last_mut() {
            Some((_, last_end)) if begin <= last_end.saturating_add(1) => {
                *last_end = (*last_end).max(end);
            }
            _ => out.push((begin, end)),
        }
    }
    out
}

fn ranges_contain(sup: &[(u64, u64)], sub: &[(u64, u64)]) -> bool {
    sub.iter().all(|(begin, end)| {
        sup.iter()
            .any(|(sup_begin, sup_end)| sup_begin <= begin && end <= sup_end)
    })
}

fn intersect_ranges(a: &[(u64, u64)], b: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let mut out = vec![];
    for &(a_begin, a_end) in a {
        for &(b_begin, b_end) in b {
            let begin = a_begin.max(b_begin);
            let end = a_end.min(b_end);
            if begin <= end {
                out.push((begin, end));
            }
        }
    }
    normalize_ranges(out)
}

fn subtract_ranges(a: &[(u64, u64)], b: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let mut out = a.to_vec();
    for &(b_begin, b_end) in b {
        let mut next = vec![];
        for (a_begin, a_end) in out {
            if b_end < a_begin || a_end < b_begin {
                next.push((a_begin, a_end));
                continue;
            }
            if a_begin < b_begin {
                next.push((a_begin, b_begin - 1));
            }
            if b_end < a_end {
                next.push((b_end + 1, a_end));
            }
        }
        out = next;
    }
    normalize_ranges(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_arithmetic() {
        let capacity = Resources::cpus_mem(10.0, 10240.0);
        let used = Resources::cpus_mem(4.0, 2048.0);
        let free = capacity.clone() - used.clone();
        assert_eq!(free.cpus(), 6.0);
        assert_eq!(free.mem_mib(), 8192.0);
        assert_eq!(free + used, capacity);
    }

    #[test]
    fn test_subtraction_saturates_at_zero() {
        let small = Resources::cpus_mem(1.0, 32.0);
        let large = Resources::cpus_mem(4.0, 1024.0);
        let out = small - large;
        assert!(out.is_empty());
        assert_eq!(out.cpus(), 0.0);
    }

    #[test]
    fn test_contains() {
        let free = Resources::cpus_mem(2.0, 1024.0);
        assert!(free.contains(&Resources::cpus_mem(2.0, 1024.0)));
        assert!(free.contains(&Resources::cpus_mem(1.0, 512.0)));
        assert!(!free.contains(&Resources::cpus_mem(3.0, 512.0)));
        assert!(!free.contains(&Resources::new().with_scalar("gpus", 1.0)));
        assert!(free.contains(&Resources::new()));
    }

    #[test]
    fn test_ranges() {
        let ports = Resources::new().with_ranges("ports", vec![(31000, 31009), (31010, 31019)]);
        assert_eq!(
            ports.get("ports"),
            Some(&Value::Ranges(vec![(31000, 31019)]))
        );

        let chunk = Resources::new().with_ranges("ports", vec![(31005, 31008)]);
        assert!(ports.contains(&chunk));

        let rest = ports.clone() - chunk.clone();
        assert_eq!(
            rest.get("ports"),
            Some(&Value::Ranges(vec![(31000, 31004), (31009, 31019)]))
        );
        assert!(!rest.contains(&chunk));
        assert_eq!(rest + chunk, ports);
    }

    #[test]
    fn test_range_intersection() {
        let a = Resources::new().with_ranges("ports", vec![(1, 10), (20, 30)]);
        let b = Resources::new().with_ranges("ports", vec![(5, 25)]);
        assert_eq!(
            a.intersect(&b).get("ports"),
            Some(&Value::Ranges(vec![(5, 10), (20, 25)]))
        );
    }

    #[test]
    fn test_sets() {
        let disks = Resources::new().with_set("disks", ["sda", "sdb", "sdc"]);
        let taken = Resources::new().with_set("disks", ["sdb"]);
        assert!(disks.contains(&taken));

        let rest = disks.clone() - taken.clone();
        assert_eq!(
            rest.get("disks"),
            Some(&Value::Set(BTreeSet::from([
                "sda".to_string(),
                "sdc".to_string()
            ])))
        );
        assert_eq!(disks.intersect(&taken), taken);
    }

    #[test]
    fn test_intersect_scalars() {
        let a = Resources::cpus_mem(4.0, 100.0);
        let b = Resources::cpus_mem(2.0, 200.0);
        assert_eq!(a.intersect(&b), Resources::cpus_mem(2.0, 100.0));
    }
}

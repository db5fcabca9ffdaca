//! Conda version ordering.
//!
//! Versions take the shape `[epoch!]1.2.3a4`. Components are split on `.`,
//! `-` and `_`, and each component is broken into alternating numeric and
//! alphabetic runs. Numeric runs compare numerically and win against
//! alphabetic runs, so `1.0a1 < 1.0`. The literals `dev` and `post` sort
//! below and above everything else in their position.

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A package version, ordered like conda orders versions.
///
/// The original spelling is retained for display and serialization;
/// comparisons use the parsed form, so `1.0` and `1.00` compare equal while
/// displaying differently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Version {
    raw: String,
    epoch: u64,
    components: Vec<Vec<Atom>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Atom {
    /// `dev` sorts below everything.
    Dev,
    Alpha(String),
    Num(u64),
    /// `post` sorts above everything.
    Post,
}

impl Atom {
    fn rank(&self) -> u8 {
        match self {
            Atom::Dev => 0,
            Atom::Alpha(_) => 1,
            Atom::Num(_) => 2,
            Atom::Post => 3,
        }
    }
}

impl Ord for Atom {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Atom::Alpha(a), Atom::Alpha(b)) => a.cmp(b),
            (Atom::Num(a), Atom::Num(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Atom {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn parse_component(component: &str) -> Vec<Atom> {
    let mut atoms = Vec::new();
    let mut chars = component.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            let mut run = String::new();
            while let Some(&d) = chars.peek() {
                if !d.is_ascii_digit() {
                    break;
                }
                run.push(d);
                chars.next();
            }
            // saturate instead of failing on absurd numerals
            atoms.push(Atom::Num(run.parse().unwrap_or(u64::MAX)));
        } else {
            let mut run = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() {
                    break;
                }
                run.push(d);
                chars.next();
            }
            atoms.push(match run.as_str() {
                "dev" => Atom::Dev,
                "post" => Atom::Post,
                _ => Atom::Alpha(run),
            });
        }
    }
    if atoms.is_empty() {
        atoms.push(Atom::Num(0));
    }
    atoms
}

impl Version {
    /// Parse a version string. Never fails; unparseable numerals saturate.
    pub fn parse(raw: &str) -> Self {
        let lowered = raw.trim().to_ascii_lowercase();
        let (epoch, rest) = match lowered.split_once('!') {
            Some((epoch, rest)) => (epoch.parse().unwrap_or(0), rest),
            None => (0, lowered.as_str()),
        };
        let components = rest
            .split(['.', '-', '_'])
            .filter(|part| !part.is_empty())
            .map(parse_component)
            .collect();
        Version {
            raw: raw.to_string(),
            epoch,
            components,
        }
    }

    /// The version as originally written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True if this version starts with `prefix` at a component boundary,
    /// e.g. `3.9.12` starts with `3.9`, while `3.19.1` does not.
    pub fn starts_with(&self, prefix: &Version) -> bool {
        if self.epoch != prefix.epoch || prefix.components.len() > self.components.len() {
            return false;
        }
        self.components[..prefix.components.len()] == prefix.components[..]
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch.cmp(&other.epoch).then_with(|| {
            let len = self.components.len().max(other.components.len());
            let zero = vec![Atom::Num(0)];
            for i in 0..len {
                let a = self.components.get(i).unwrap_or(&zero);
                let b = other.components.get(i).unwrap_or(&zero);
                let atoms = a.len().max(b.len());
                for j in 0..atoms {
                    let x = a.get(j).unwrap_or(&Atom::Num(0));
                    let y = b.get(j).unwrap_or(&Atom::Num(0));
                    match x.cmp(y) {
                        Ordering::Equal => {}
                        ordering => return ordering,
                    }
                }
            }
            Ordering::Equal
        })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Version {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Version::parse(s))
    }
}

impl From<String> for Version {
    fn from(raw: String) -> Self {
        Version::parse(&raw)
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.raw
    }
}

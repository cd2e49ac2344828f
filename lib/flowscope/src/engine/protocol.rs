// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Protocol identities, names, and breeds.

use core::fmt;
use serde::Serialize;

/// A classification engine's protocol identifier. Zero is always
/// "unknown".
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(transparent)]
pub struct ProtocolId(pub u16);

impl ProtocolId {
    pub const UNKNOWN: ProtocolId = ProtocolId(0);

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }

    pub fn index(&self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A coarse grouping of protocols used only for aggregate reporting.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Breed {
    Safe,
    Acceptable,
    Fun,
    Unsafe,
    PotentiallyDangerous,
    Unrated,
}

impl Breed {
    pub const ALL: [Breed; 6] = [
        Breed::Safe,
        Breed::Acceptable,
        Breed::Fun,
        Breed::Unsafe,
        Breed::PotentiallyDangerous,
        Breed::Unrated,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Safe => "Safe",
            Self::Acceptable => "Acceptable",
            Self::Fun => "Fun",
            Self::Unsafe => "Unsafe",
            Self::PotentiallyDangerous => "Potentially Dangerous",
            Self::Unrated => "Unrated",
        }
    }
}

impl fmt::Display for Breed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProtocolInfo {
    pub name: String,
    pub breed: Breed,
}

/// The set of protocols an engine can report, indexed by
/// [`ProtocolId`].
#[derive(Clone, Debug)]
pub struct ProtocolRegistry {
    protos: Vec<ProtocolInfo>,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolRegistry {
    /// A registry holding only the unknown protocol.
    pub fn new() -> Self {
        Self {
            protos: vec![ProtocolInfo {
                name: "Unknown".to_string(),
                breed: Breed::Unrated,
            }],
        }
    }

    /// Register a protocol, returning its id. Registering a name twice
    /// returns the existing id.
    pub fn register(&mut self, name: &str, breed: Breed) -> ProtocolId {
        if let Some(id) = self.lookup(name) {
            return id;
        }

        self.protos.push(ProtocolInfo { name: name.to_string(), breed });
        ProtocolId((self.protos.len() - 1) as u16)
    }

    pub fn lookup(&self, name: &str) -> Option<ProtocolId> {
        self.protos
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name))
            .map(|i| ProtocolId(i as u16))
    }

    pub fn name(&self, id: ProtocolId) -> &str {
        self.protos.get(id.index()).map_or("Unknown", |p| p.name.as_str())
    }

    pub fn breed(&self, id: ProtocolId) -> Breed {
        self.protos.get(id.index()).map_or(Breed::Unrated, |p| p.breed)
    }

    pub fn len(&self) -> usize {
        self.protos.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProtocolId, &ProtocolInfo)> {
        self.protos
            .iter()
            .enumerate()
            .map(|(i, p)| (ProtocolId(i as u16), p))
    }
}

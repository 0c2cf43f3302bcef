// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Designated code requirements.
//!
//! A designated requirement is the expression a signature asserts must hold
//! for other code to consider it authentic. We pin outer containers to their
//! own identifier and to Apple's certificate anchor instead of letting the
//! signing tool infer a requirement.

use std::fmt::{Display, Formatter};

/// The trusted anchor a requirement is pinned to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequirementAnchor {
    /// `anchor apple generic`: any certificate chaining to Apple's root.
    AppleGeneric,
}

impl Display for RequirementAnchor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AppleGeneric => f.write_str("anchor apple generic"),
        }
    }
}

/// A designated requirement expression pinned to an identifier and anchor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DesignatedRequirement {
    identifier: String,
    anchor: RequirementAnchor,
    team_id: Option<String>,
}

impl DesignatedRequirement {
    /// Construct a requirement pinned to `identifier` and Apple's anchor.
    pub fn new(identifier: impl ToString) -> Self {
        Self {
            identifier: identifier.to_string(),
            anchor: RequirementAnchor::AppleGeneric,
            team_id: None,
        }
    }

    /// Additionally require the leaf certificate to belong to a team.
    #[must_use]
    pub fn with_team_id(mut self, team_id: Option<&str>) -> Self {
        self.team_id = team_id.map(|x| x.to_string());
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }

    /// The requirement expression, as accepted by `codesign -R`.
    pub fn expression(&self) -> String {
        let mut s = format!("identifier \"{}\" and {}", self.identifier, self.anchor);

        if let Some(team) = &self.team_id {
            s.push_str(&format!(" and certificate leaf[subject.OU] = \"{}\"", team));
        }

        s
    }

    /// The requirement as a `designated =>` statement, as accepted by `codesign -r`.
    pub fn statement(&self) -> String {
        format!("designated => {}", self.expression())
    }
}

impl Display for DesignatedRequirement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression())
    }
}

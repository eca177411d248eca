//! Tie-breaker election among responding primaries
//!
//! Every responding node reports the value stored under the tie-breaker key;
//! the value names the node (`host:port`) that should be primary. The most
//! nominated candidate wins. When nothing usable was nominated the first
//! responding primary is taken and the outcome is flagged arbitrary.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::ServerAddress;

/// Nominations gathered in one reconfiguration cycle
#[derive(Debug, Clone, Default)]
pub struct ElectionBallot {
    votes: BTreeMap<String, usize>,
}

impl ElectionBallot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one node's tie-breaker value; nil and blank values abstain
    pub fn record(&mut self, nomination: Option<&str>) {
        if let Some(value) = nomination.map(str::trim).filter(|v| !v.is_empty()) {
            *self.votes.entry(value.to_string()).or_insert(0) += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn total(&self) -> usize {
        self.votes.values().sum()
    }

    /// (value, count) by count descending, then value ascending
    pub fn tally(&self) -> Vec<(String, usize)> {
        let mut tally: Vec<(String, usize)> =
            self.votes.iter().map(|(v, c)| (v.clone(), *c)).collect();
        tally.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        tally
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    /// No primary responded
    NoCandidates,
    /// Exactly one primary; no vote needed
    Single,
    /// Every nomination named the same value
    Unanimous,
    /// One value had strictly more nominations than any other
    Plurality,
    /// Several values tied for the most nominations
    Contested,
    /// Nobody nominated anything
    NoNominations,
}

#[derive(Debug, Clone, Serialize)]
pub struct ElectionOutcome {
    pub elected: Option<ServerAddress>,
    pub verdict: Verdict,
    /// The choice was not decided by the ballot alone
    pub arbitrary: bool,
    pub winning_nomination: Option<String>,
    pub tally: Vec<(String, usize)>,
}

fn matches_candidate(nomination: &str, candidate: &ServerAddress) -> bool {
    match nomination.parse::<ServerAddress>() {
        Ok(addr) => addr.host.eq_ignore_ascii_case(&candidate.host) && addr.port == candidate.port,
        Err(_) => false,
    }
}

/// Pick one primary out of `candidates` (in response order)
pub fn elect(candidates: &[ServerAddress], ballot: &ElectionBallot) -> ElectionOutcome {
    let tally = ballot.tally();

    let Some(first) = candidates.first() else {
        return ElectionOutcome {
            elected: None,
            verdict: Verdict::NoCandidates,
            arbitrary: false,
            winning_nomination: None,
            tally,
        };
    };

    if candidates.len() == 1 {
        return ElectionOutcome {
            elected: Some(first.clone()),
            verdict: Verdict::Single,
            arbitrary: false,
            winning_nomination: None,
            tally,
        };
    }

    let Some((top_value, top_count)) = tally.first().cloned() else {
        return ElectionOutcome {
            elected: Some(first.clone()),
            verdict: Verdict::NoNominations,
            arbitrary: true,
            winning_nomination: None,
            tally,
        };
    };

    let tied = tally.iter().filter(|(_, c)| *c == top_count).count();
    let verdict = if tally.len() == 1 {
        Verdict::Unanimous
    } else if tied > 1 {
        Verdict::Contested
    } else {
        Verdict::Plurality
    };

    let nominated = candidates
        .iter()
        .find(|c| matches_candidate(&top_value, c))
        .cloned();
    let arbitrary = verdict == Verdict::Contested || nominated.is_none();

    ElectionOutcome {
        elected: Some(nominated.unwrap_or_else(|| first.clone())),
        verdict,
        arbitrary,
        winning_nomination: Some(top_value),
        tally,
    }
}

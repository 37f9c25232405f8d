//! Greedy forward selection driven by the grid search.
//!
//! The accumulated state lives in a [`SelectionSession`] value that is
//! threaded through [`ForwardSelector::step`]; nothing is held globally.

use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::error::{Result, SelectionError};
use crate::grid::{GridSearch, ScoredCombination};
use crate::metrics::Direction;
use crate::model::Hyperparameters;
use crate::store::{persisted_score, SelectionStore, StoredSelection};
use crate::telemetry::{log, SelectionTelemetry};

/// Rounds run by default.
pub const DEFAULT_ROUNDS: usize = 200;

/// Lifecycle of a selection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionState {
    /// Nothing committed yet.
    Initial,
    /// At least one round committed, more may follow.
    Selecting,
    /// Budget spent, candidates exhausted, or plateau reached.
    Done,
}

/// One committed round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// One-based round index.
    pub round: usize,
    /// Descriptor committed in this round.
    pub feature: String,
    /// Winning fold-averaged score.
    pub score: f64,
    /// Combination behind the score; unknown for rounds restored from disk.
    pub params: Option<Hyperparameters>,
}

/// Explicit selection state: committed subset, trace, next round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionSession {
    committed: Vec<String>,
    trace: Vec<TraceEntry>,
    next_round: usize,
    state: SelectionState,
}

impl Default for SelectionSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionSession {
    /// Fresh session at round 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            committed: Vec::new(),
            trace: Vec::new(),
            next_round: 1,
            state: SelectionState::Initial,
        }
    }

    /// Session continuing from persisted artifacts.
    #[must_use]
    pub fn resume(stored: StoredSelection) -> Self {
        let trace: Vec<TraceEntry> = stored
            .features
            .iter()
            .zip(&stored.trace)
            .map(|(feature, line)| TraceEntry {
                round: line.round,
                feature: feature.clone(),
                score: line.score,
                params: None,
            })
            .collect();
        let state = if trace.is_empty() {
            SelectionState::Initial
        } else {
            SelectionState::Selecting
        };
        Self {
            next_round: trace.len() + 1,
            committed: stored.features,
            trace,
            state,
        }
    }

    /// Committed descriptors in commit order.
    #[must_use]
    pub fn committed(&self) -> &[String] {
        &self.committed
    }

    /// Committed rounds.
    #[must_use]
    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    /// Index of the round `step` would run next.
    #[must_use]
    pub const fn next_round(&self) -> usize {
        self.next_round
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SelectionState {
        self.state
    }

    /// Returns true once no further rounds will run.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == SelectionState::Done
    }

    fn finish(mut self) -> Self {
        self.state = SelectionState::Done;
        self
    }
}

/// Round budget and stopping rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Maximum number of committed rounds.
    pub rounds: usize,
    /// Stop after a round that fails to improve the best score so far.
    pub stop_on_plateau: bool,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            rounds: DEFAULT_ROUNDS,
            stop_on_plateau: false,
        }
    }
}

/// Grid outcome for one candidate descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScore {
    /// Candidate descriptor.
    pub feature: String,
    /// Best combination, `None` when every combination was skipped.
    pub best: Option<ScoredCombination>,
}

/// Forward selector over a prepared grid search.
#[derive(Debug)]
pub struct ForwardSelector<'a> {
    search: GridSearch<'a>,
    config: SelectorConfig,
    store: Option<&'a SelectionStore>,
    telemetry: Option<&'a SelectionTelemetry>,
}

impl<'a> ForwardSelector<'a> {
    /// Wraps a grid search.
    pub fn new(search: GridSearch<'a>, config: SelectorConfig) -> Result<Self> {
        if config.rounds == 0 {
            return Err(SelectionError::Configuration("round budget must be at least 1".into()));
        }
        Ok(Self {
            search,
            config,
            store: None,
            telemetry: None,
        })
    }

    /// Persists every committed round to `store`.
    #[must_use]
    pub const fn with_store(mut self, store: &'a SelectionStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Attaches telemetry to the selector and its grid search.
    #[must_use]
    pub fn telemetry(mut self, telemetry: Option<&'a SelectionTelemetry>) -> Self {
        self.search = self.search.telemetry(telemetry);
        self.telemetry = telemetry;
        self
    }

    /// Runs rounds until the session is done.
    pub fn run(&self, mut session: SelectionSession) -> Result<SelectionSession> {
        log(
            self.telemetry,
            LogLevel::Info,
            "selection.run_started",
            json!({
                "metric": self.search.metric().to_string(),
                "rounds": self.config.rounds,
                "resumed_at": session.next_round,
                "descriptors": self.search.dataset().width(),
                "samples": self.search.dataset().len(),
            }),
        );
        while !session.is_done() {
            session = self.step(session)?;
        }
        log(
            self.telemetry,
            LogLevel::Info,
            "selection.run_finished",
            json!({
                "committed": session.committed.len(),
                "final_score": session.trace.last().map(|entry| entry.score),
            }),
        );
        Ok(session)
    }

    /// Performs one round: scores every uncommitted descriptor, commits the
    /// best, persists, and advances the round counter.
    pub fn step(&self, session: SelectionSession) -> Result<SelectionSession> {
        if session.is_done() {
            return Ok(session);
        }
        let remaining = self.candidates(&session)?;
        if session.next_round > self.config.rounds || remaining.is_empty() {
            return Ok(session.finish());
        }
        let round = session.next_round;
        log(
            self.telemetry,
            LogLevel::Info,
            "selection.round_started",
            json!({ "round": round, "candidates": remaining.len() }),
        );

        let scored = self.score_candidates(&session.committed, &remaining)?;
        let direction = self.search.metric().direction();
        let winner = direction
            .best_by(
                scored
                    .into_iter()
                    .filter_map(|candidate| candidate.best.map(|best| (candidate.feature, best))),
                |(_, best)| best.score,
            )
            .ok_or(SelectionError::NoViableCandidate { round })?;
        let (feature, best) = winner;

        let plateau = is_plateau(direction, &session.trace, best.score);

        let mut session = session;
        session.committed.push(feature.clone());
        if let Some(store) = self.store {
            store.commit(round, best.score, &session.committed)?;
        }
        session.trace.push(TraceEntry {
            round,
            feature: feature.clone(),
            score: best.score,
            params: Some(best.params),
        });
        session.next_round += 1;
        session.state = SelectionState::Selecting;
        log(
            self.telemetry,
            LogLevel::Info,
            "selection.round_committed",
            json!({
                "round": round,
                "feature": feature,
                "score": best.score,
                "components": best.params.components,
                "c": best.params.c,
                "gamma": best.params.gamma,
                "plateau": plateau,
            }),
        );

        let exhausted = session.committed.len() == self.search.dataset().width();
        if session.next_round > self.config.rounds || exhausted || (plateau && self.config.stop_on_plateau) {
            return Ok(session.finish());
        }
        Ok(session)
    }

    /// Scores each candidate appended to `committed`, in the order given.
    pub fn score_candidates(&self, committed: &[String], candidates: &[String]) -> Result<Vec<CandidateScore>> {
        let mut scored = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let mut subset = committed.to_vec();
            subset.push(candidate.clone());
            let outcome = self.search.evaluate(&subset)?;
            match outcome.best {
                Some(best) => log(
                    self.telemetry,
                    LogLevel::Debug,
                    "selection.candidate_scored",
                    json!({
                        "feature": candidate,
                        "score": best.score,
                        "evaluated": outcome.evaluated,
                        "skipped": outcome.skipped,
                        "unconverged": outcome.unconverged,
                    }),
                ),
                None => log(
                    self.telemetry,
                    LogLevel::Warn,
                    "selection.candidate_unusable",
                    json!({ "feature": candidate, "skipped": outcome.skipped }),
                ),
            }
            scored.push(CandidateScore {
                feature: candidate.clone(),
                best: outcome.best,
            });
        }
        Ok(scored)
    }

    /// Uncommitted descriptors in dataset column order.
    fn candidates(&self, session: &SelectionSession) -> Result<Vec<String>> {
        let dataset = self.search.dataset();
        if let Some(unknown) = session
            .committed
            .iter()
            .find(|name| !dataset.has_descriptor(name))
        {
            return Err(SelectionError::UnknownDescriptor(unknown.clone()));
        }
        Ok(dataset
            .descriptor_names()
            .filter(|name| !session.committed.iter().any(|committed| committed == name))
            .map(str::to_owned)
            .collect())
    }
}

/// Returns true when `score` fails to improve on the best committed score.
///
/// Both sides are compared as persisted in the trace, so a resumed session
/// (whose scores come back rounded) decides exactly like an uninterrupted one.
fn is_plateau(direction: Direction, trace: &[TraceEntry], score: f64) -> bool {
    direction
        .best_by(trace.iter().map(|entry| persisted_score(entry.score)), |s| *s)
        .is_some_and(|prev| !direction.improves(persisted_score(score), prev))
}

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::detection::{Category, DetectionSet};

/// A rule the test taker can break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViolationKind {
    NoPerson,
    MultiplePeople,
    MultipleMonitors,
    Phone,
    Book,
}

impl ViolationKind {
    pub const ALL: [ViolationKind; 5] = [
        ViolationKind::NoPerson,
        ViolationKind::MultiplePeople,
        ViolationKind::MultipleMonitors,
        ViolationKind::Phone,
        ViolationKind::Book,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::NoPerson => "no_person",
            ViolationKind::MultiplePeople => "multiple_people",
            ViolationKind::MultipleMonitors => "multiple_monitors",
            ViolationKind::Phone => "phone",
            ViolationKind::Book => "book",
        }
    }

    /// Message shown to proctors; the server stores it verbatim.
    pub fn message(&self) -> &'static str {
        match self {
            ViolationKind::NoPerson => "Exam taker left",
            ViolationKind::MultiplePeople => "multiple people detected",
            ViolationKind::MultipleMonitors => "multiple PC monitors/laptops detected",
            ViolationKind::Phone => "cellphone detected",
            ViolationKind::Book => "book detected",
        }
    }

    /// Detection category whose boxes illustrate the violation.
    pub fn evidence(&self) -> Category {
        match self {
            ViolationKind::NoPerson | ViolationKind::MultiplePeople => Category::Person,
            ViolationKind::MultipleMonitors => Category::Monitor,
            ViolationKind::Phone => Category::Phone,
            ViolationKind::Book => Category::Book,
        }
    }

    fn index(self) -> usize {
        match self {
            ViolationKind::NoPerson => 0,
            ViolationKind::MultiplePeople => 1,
            ViolationKind::MultipleMonitors => 2,
            ViolationKind::Phone => 3,
            ViolationKind::Book => 4,
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebounceThreshold {
    /// Cycles with the condition present before the violation fires.
    pub occurrence_max: u32,
    /// Consecutive absent cycles that end an episode.
    pub discontinue_max: u32,
}

impl DebounceThreshold {
    pub const fn new(occurrence_max: u32, discontinue_max: u32) -> Self {
        Self {
            occurrence_max,
            discontinue_max,
        }
    }

    fn sanitized(self) -> Self {
        Self {
            occurrence_max: self.occurrence_max.max(1),
            discontinue_max: self.discontinue_max.max(1),
        }
    }
}

/// Per-rule thresholds. A partial override in the settings file only
/// replaces the fields it names; the rest keep that rule's defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RuleOverrides")]
pub struct DebounceRules {
    pub no_person: DebounceThreshold,
    pub multiple_people: DebounceThreshold,
    pub multiple_monitors: DebounceThreshold,
    pub phone: DebounceThreshold,
    pub book: DebounceThreshold,
}

impl Default for DebounceRules {
    fn default() -> Self {
        Self {
            no_person: DebounceThreshold::new(10, 10),
            multiple_people: DebounceThreshold::new(20, 20),
            multiple_monitors: DebounceThreshold::new(10, 10),
            phone: DebounceThreshold::new(3, 10),
            book: DebounceThreshold::new(3, 10),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ThresholdOverride {
    occurrence_max: Option<u32>,
    discontinue_max: Option<u32>,
}

impl ThresholdOverride {
    fn over(self, base: DebounceThreshold) -> DebounceThreshold {
        DebounceThreshold {
            occurrence_max: self.occurrence_max.unwrap_or(base.occurrence_max),
            discontinue_max: self.discontinue_max.unwrap_or(base.discontinue_max),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RuleOverrides {
    no_person: ThresholdOverride,
    multiple_people: ThresholdOverride,
    multiple_monitors: ThresholdOverride,
    phone: ThresholdOverride,
    book: ThresholdOverride,
}

impl From<RuleOverrides> for DebounceRules {
    fn from(overrides: RuleOverrides) -> Self {
        let base = DebounceRules::default();
        Self {
            no_person: overrides.no_person.over(base.no_person),
            multiple_people: overrides.multiple_people.over(base.multiple_people),
            multiple_monitors: overrides.multiple_monitors.over(base.multiple_monitors),
            phone: overrides.phone.over(base.phone),
            book: overrides.book.over(base.book),
        }
    }
}

impl DebounceRules {
    pub fn threshold(&self, kind: ViolationKind) -> DebounceThreshold {
        match kind {
            ViolationKind::NoPerson => self.no_person,
            ViolationKind::MultiplePeople => self.multiple_people,
            ViolationKind::MultipleMonitors => self.multiple_monitors,
            ViolationKind::Phone => self.phone,
            ViolationKind::Book => self.book,
        }
    }
}

/// Hysteresis counters for one rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterState {
    pub occurrence: u32,
    pub discontinue: u32,
}

impl CounterState {
    /// Advances one cycle and reports whether the violation fires now.
    ///
    /// Once fired, `occurrence` parks at `occurrence_max + 1` so the rule stays
    /// quiet for the rest of the episode; only `discontinue_max` absent cycles
    /// in a row re-arm it.
    pub fn step(&mut self, present: bool, threshold: DebounceThreshold) -> bool {
        let threshold = threshold.sanitized();

        if present {
            self.occurrence = (self.occurrence + 1).min(threshold.occurrence_max + 1);
            self.discontinue = 0;
        } else if self.occurrence > 0 {
            self.discontinue += 1;
        }

        if self.discontinue >= threshold.discontinue_max {
            self.occurrence = 0;
            self.discontinue = 0;
        }

        if self.occurrence == threshold.occurrence_max {
            self.occurrence += 1;
            return true;
        }
        false
    }

    pub fn has_fired(&self, threshold: DebounceThreshold) -> bool {
        self.occurrence > threshold.sanitized().occurrence_max
    }
}

/// Turns noisy per-frame detections into discrete, once-per-episode violations.
#[derive(Debug, Clone)]
pub struct ViolationDebouncer {
    rules: DebounceRules,
    allow_books: bool,
    counters: [CounterState; 5],
}

impl ViolationDebouncer {
    pub fn new(rules: DebounceRules, allow_books: bool) -> Self {
        Self {
            rules,
            allow_books,
            counters: [CounterState::default(); 5],
        }
    }

    pub fn state(&self, kind: ViolationKind) -> CounterState {
        self.counters[kind.index()]
    }

    /// Whether each rule's condition holds for this cycle's detections.
    pub fn condition(&self, kind: ViolationKind, detections: &DetectionSet) -> bool {
        match kind {
            ViolationKind::NoPerson => detections.count(Category::Person) == 0,
            ViolationKind::MultiplePeople => detections.count(Category::Person) > 1,
            ViolationKind::MultipleMonitors => detections.count(Category::Monitor) > 1,
            ViolationKind::Phone => detections.count(Category::Phone) > 0,
            ViolationKind::Book => !self.allow_books && detections.count(Category::Book) > 0,
        }
    }

    /// Feeds one rule's condition for this cycle.
    pub fn update(&mut self, kind: ViolationKind, present: bool) -> bool {
        let threshold = self.rules.threshold(kind);
        self.counters[kind.index()].step(present, threshold)
    }

    /// Runs one inference cycle through every rule, returning the rules that fired.
    pub fn observe(&mut self, detections: &DetectionSet) -> Vec<ViolationKind> {
        ViolationKind::ALL
            .into_iter()
            .filter(|kind| {
                let present = self.condition(*kind, detections);
                self.update(*kind, present)
            })
            .collect()
    }
}

use std::sync::Mutex;

use thiserror::Error;

const HISTORY_CAP: usize = 512;
const MAX_MISSES: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PredictorError {
    /// Too many unexplained values in one check; the caller should rebuild
    /// the predictor and retrain.
    #[error("predictor lost sync")]
    OutOfSync,
    #[error("no cycle")]
    NoCycle,
}

/// Learns the repeating pattern of first-differences in a counter sequence
/// and predicts values forward and backward from it.
///
/// All arithmetic is modulo 2^64: servers mix high bits into their session
/// IDs, so the differences regularly "wrap" and only wrapping math keeps the
/// cycle stable.
pub struct CounterPredictor {
    min_rep: usize,
    min_len: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    cycle: Vec<u64>,
    samples: Vec<u64>,
    history: Vec<u64>,
    cycle_index: usize,
    last_sample: Option<u64>,
}

impl CounterPredictor {
    pub fn new(min_rep: usize, min_len: usize) -> Self {
        Self {
            min_rep,
            min_len,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Feeds one observed value into the training phase. Returns true when
    /// this sample completed cycle discovery.
    pub fn submit_sample(&self, v: u64) -> bool {
        let mut inner = self.lock();
        let last = match inner.last_sample {
            Some(last) => last,
            None => {
                inner.last_sample = Some(v);
                return false;
            }
        };

        let diff = v.wrapping_sub(last);
        inner.samples.push(diff);
        inner.history.push(v);
        inner.last_sample = Some(v);
        self.predict_cycle(&mut inner)
    }

    pub fn ready(&self) -> bool {
        !self.lock().cycle.is_empty()
    }

    /// A copy of the detected difference cycle (empty while training).
    pub fn cycle(&self) -> Vec<u64> {
        self.lock().cycle.clone()
    }

    pub fn sample_count(&self) -> usize {
        self.lock().samples.len()
    }

    /// Submits a value observed during the prediction phase. Returns the
    /// predicted values that were skipped over (sessions created by someone
    /// else between our probes), in order.
    pub fn check(&self, v: u64) -> Result<Vec<u64>, PredictorError> {
        let mut inner = self.lock();
        if inner.cycle.is_empty() {
            return Ok(Vec::new());
        }

        let mut last = match inner.history.last() {
            Some(&last) => last,
            None => return Ok(Vec::new()),
        };

        let mut missed = Vec::new();
        let mut predicted = last.wrapping_add(inner.cycle[inner.cycle_index]);
        while predicted != v {
            missed.push(predicted);
            if missed.len() > MAX_MISSES {
                return Err(PredictorError::OutOfSync);
            }

            inner.cycle_index = (inner.cycle_index + 1) % inner.cycle.len();
            push_history(&mut inner.history, predicted);
            last = predicted;
            predicted = last.wrapping_add(inner.cycle[inner.cycle_index]);
        }

        inner.cycle_index = (inner.cycle_index + 1) % inner.cycle.len();
        push_history(&mut inner.history, v);
        Ok(missed)
    }

    /// Rolls the phase back one step and returns the value preceding `v`.
    pub fn previous(&self, v: u64) -> Result<u64, PredictorError> {
        let mut inner = self.lock();
        if inner.cycle.is_empty() {
            return Err(PredictorError::NoCycle);
        }

        inner.cycle_index = match inner.cycle_index {
            0 => inner.cycle.len() - 1,
            i => i - 1,
        };
        Ok(v.wrapping_sub(inner.cycle[inner.cycle_index]))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn predict_cycle(&self, inner: &mut Inner) -> bool {
        if inner.samples.len() < self.min_rep * self.min_len {
            return false;
        }

        let end_search = inner.samples.len() - (self.min_rep - 1) * self.min_len;
        for i in 0..end_search {
            for x in self.min_len..=self.min_len * 10 {
                if i + x >= inner.samples.len() {
                    break;
                }
                let candidate = &inner.samples[i..i + x];
                if contains_repeated(&inner.samples, candidate, self.min_rep + 1) {
                    inner.cycle = candidate.to_vec();
                    calculate_cycle_index(inner);
                    return true;
                }
            }
        }
        false
    }
}

/// True when `candidate` repeated `reps` times appears as a contiguous run
/// of the sample sequence.
fn contains_repeated(samples: &[u64], candidate: &[u64], reps: usize) -> bool {
    let needed = candidate.len() * reps;
    if needed > samples.len() {
        return false;
    }
    samples.windows(needed).any(|window| {
        window
            .iter()
            .enumerate()
            .all(|(k, &v)| v == candidate[k % candidate.len()])
    })
}

/// Phase-aligns the cycle against the tail of the sample sequence: locate
/// the last occurrence of the cycle, count the differences from there to the
/// end, reduce modulo the cycle length.
fn calculate_cycle_index(inner: &mut Inner) {
    let n = inner.cycle.len();
    let last_at = (0..=inner.samples.len().saturating_sub(n))
        .rev()
        .find(|&j| inner.samples[j..j + n] == inner.cycle[..]);
    match last_at {
        Some(j) => inner.cycle_index = (inner.samples.len() - j) % n,
        None => {
            log::warn!(
                "failed to calculate cycle index: {} in {}",
                hex_sequence(&inner.cycle),
                hex_sequence(&inner.samples)
            );
        }
    }
}

fn push_history(history: &mut Vec<u64>, v: u64) {
    history.push(v);
    if history.len() > HISTORY_CAP {
        let excess = history.len() - HISTORY_CAP;
        history.drain(..excess);
    }
}

/// Canonical rendering of a difference sequence: lowercase hex values joined
/// with dashes.
pub fn hex_sequence(values: &[u64]) -> String {
    values
        .iter()
        .map(|v| format!("{v:x}"))
        .collect::<Vec<_>>()
        .join("-")
}

//! Event grouping at a time point.
//!
//! Patients whose event (death or censoring) happened by the time point are split into
//! an alternating sequence of censoring and death groups. Group `i` is the block of
//! censorings that precede the `i`-th block of deaths, so the two lists always have
//! the same length.

use km_core::{Error, Result};
use std::cmp::Ordering;

/// `true` when the patient is still in the risk set at `time_point`.
///
/// Censoring exactly at the time point counts as still at risk; a death does not.
pub fn still_at_risk(time: f64, censored: bool, time_point: f64) -> bool {
    time > time_point || (time == time_point && censored)
}

/// `true` when the patient is known to be alive after `time_point`.
pub fn alive(time: f64, time_point: f64) -> bool {
    time > time_point
}

/// Ordered censoring/death groups of patient indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventGroups {
    /// `censored[i]`: patients censored just before death group `i`.
    pub censored: Vec<Vec<usize>>,
    /// `died[i]`: patients dying together in group `i`.
    pub died: Vec<Vec<usize>>,
}

impl EventGroups {
    /// Number of (censoring, death) group pairs.
    pub fn n_groups(&self) -> usize {
        self.censored.len()
    }

    /// Group sizes of the censoring groups.
    pub fn censored_counts(&self) -> Vec<usize> {
        self.censored.iter().map(Vec::len).collect()
    }

    /// Group sizes of the death groups.
    pub fn died_counts(&self) -> Vec<usize> {
        self.died.iter().map(Vec::len).collect()
    }

    /// Per-group counts restricted to the selected patients.
    pub fn counts_for(&self, selected: &[bool]) -> (Vec<usize>, Vec<usize>) {
        let count = |groups: &[Vec<usize>]| -> Vec<usize> {
            groups
                .iter()
                .map(|g| g.iter().filter(|&&i| selected.get(i).copied().unwrap_or(false)).count())
                .collect()
        };
        (count(&self.censored), count(&self.died))
    }
}

/// Split the patients whose event has happened into censoring/death groups.
///
/// Events are ordered by time with deaths before censorings at equal times, and
/// consecutive events of the same type are merged. A leading death group gets an empty
/// censoring group in front of it; a trailing censoring group is dropped since no death
/// follows it. Without any event a single empty pair is returned.
pub fn group_patients(
    times: &[f64],
    censored: &[bool],
    still_at_risk: &[bool],
) -> Result<EventGroups> {
    if times.len() != censored.len() || times.len() != still_at_risk.len() {
        return Err(Error::Internal(format!(
            "group_patients: length mismatch (times={}, censored={}, still_at_risk={})",
            times.len(),
            censored.len(),
            still_at_risk.len()
        )));
    }

    let mut order: Vec<usize> = (0..times.len()).filter(|&i| !still_at_risk[i]).collect();
    order.sort_by(|&a, &b| {
        times[a]
            .partial_cmp(&times[b])
            .unwrap_or(Ordering::Equal)
            // deaths (false) before censorings (true)
            .then_with(|| censored[a].cmp(&censored[b]))
    });

    let mut censored_groups: Vec<Vec<usize>> = Vec::new();
    let mut died_groups: Vec<Vec<usize>> = Vec::new();
    let mut first_type: Option<bool> = None;
    let mut last_type: Option<bool> = None;

    let mut i = 0;
    while i < order.len() {
        let current = censored[order[i]];
        let mut block = Vec::new();
        while i < order.len() && censored[order[i]] == current {
            block.push(order[i]);
            i += 1;
        }
        if first_type.is_none() {
            first_type = Some(current);
        }
        last_type = Some(current);
        if current {
            censored_groups.push(block);
        } else {
            died_groups.push(block);
        }
    }

    if first_type == Some(false) {
        censored_groups.insert(0, Vec::new());
    }
    if last_type == Some(true) {
        censored_groups.pop();
    }
    if censored_groups.is_empty() && died_groups.is_empty() {
        censored_groups.push(Vec::new());
        died_groups.push(Vec::new());
    }

    if censored_groups.len() != died_groups.len() {
        return Err(Error::Internal(format!(
            "mismatched group lists: {} censoring vs {} death groups",
            censored_groups.len(),
            died_groups.len()
        )));
    }

    Ok(EventGroups { censored: censored_groups, died: died_groups })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Indices of event patients that fall in no group (the dropped trailing censorings).
    fn ungrouped_events(groups: &EventGroups, still_at_risk: &[bool]) -> Vec<usize> {
        let mut grouped = vec![false; still_at_risk.len()];
        for g in groups.censored.iter().chain(groups.died.iter()) {
            for &i in g {
                grouped[i] = true;
            }
        }
        (0..still_at_risk.len()).filter(|&i| !still_at_risk[i] && !grouped[i]).collect()
    }

    fn flags(times: &[f64], censored: &[bool], t: f64) -> Vec<bool> {
        times.iter().zip(censored).map(|(&ti, &c)| still_at_risk(ti, c, t)).collect()
    }

    #[test]
    fn test_risk_set_rules() {
        assert!(still_at_risk(3.0, false, 2.0));
        assert!(still_at_risk(2.0, true, 2.0));
        assert!(!still_at_risk(2.0, false, 2.0));
        assert!(!still_at_risk(1.0, true, 2.0));
        assert!(alive(3.0, 2.0));
        assert!(!alive(2.0, 2.0));
    }

    #[test]
    fn test_alternating_groups() {
        // c d d c c d c  at times 1..7, evaluated after everything.
        let times = [1.0, 2.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let censored = [true, false, false, true, true, false, true];
        let risk = flags(&times, &censored, 10.0);
        let g = group_patients(&times, &censored, &risk).unwrap();
        assert_eq!(g.censored, vec![vec![0], vec![3, 4]]);
        assert_eq!(g.died, vec![vec![1, 2], vec![5]]);
        assert_eq!(ungrouped_events(&g, &risk), vec![6]);
    }

    #[test]
    fn test_leading_death_gets_empty_censoring_group() {
        let times = [1.0, 2.0];
        let censored = [false, true];
        let risk = flags(&times, &censored, 1.5);
        let g = group_patients(&times, &censored, &risk).unwrap();
        assert_eq!(g.censored, vec![Vec::<usize>::new()]);
        assert_eq!(g.died, vec![vec![0]]);
    }

    #[test]
    fn test_tie_orders_deaths_first() {
        let times = [2.0, 2.0, 2.0];
        let censored = [true, false, true];
        let risk = flags(&times, &censored, 3.0);
        let g = group_patients(&times, &censored, &risk).unwrap();
        assert_eq!(g.censored, vec![Vec::<usize>::new()]);
        assert_eq!(g.died, vec![vec![1]]);
    }

    #[test]
    fn test_no_events_single_empty_pair() {
        let times = [5.0, 6.0];
        let censored = [false, true];
        let risk = flags(&times, &censored, 1.0);
        let g = group_patients(&times, &censored, &risk).unwrap();
        assert_eq!(g.n_groups(), 1);
        assert_eq!(g.censored_counts(), vec![0]);
        assert_eq!(g.died_counts(), vec![0]);
    }

    #[test]
    fn test_only_censorings_collapse_to_empty_pair() {
        let times = [1.0, 2.0];
        let censored = [true, true];
        let risk = flags(&times, &censored, 3.0);
        let g = group_patients(&times, &censored, &risk).unwrap();
        assert_eq!(g.n_groups(), 1);
        assert_eq!(ungrouped_events(&g, &risk), vec![0, 1]);
    }

    #[test]
    fn test_length_mismatch_is_internal() {
        let err = group_patients(&[1.0], &[true, false], &[false]).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_counts_for_selection() {
        let times = [1.0, 2.0, 3.0, 4.0];
        let censored = [true, false, true, false];
        let risk = flags(&times, &censored, 10.0);
        let g = group_patients(&times, &censored, &risk).unwrap();
        let (c, d) = g.counts_for(&[true, false, true, true]);
        assert_eq!(c, vec![1, 1]);
        assert_eq!(d, vec![0, 1]);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn prop_groups_partition_events(
            raw in proptest::collection::vec((0u8..8, any::<bool>()), 0..20),
            t in 0u8..9,
        ) {
            let times: Vec<f64> = raw.iter().map(|(ti, _)| *ti as f64).collect();
            let censored: Vec<bool> = raw.iter().map(|(_, c)| *c).collect();
            let risk = flags(&times, &censored, t as f64);
            let g = group_patients(&times, &censored, &risk).unwrap();

            prop_assert_eq!(g.censored.len(), g.died.len());
            let n_events = risk.iter().filter(|r| !**r).count();
            let grouped: usize = g.censored_counts().iter().sum::<usize>()
                + g.died_counts().iter().sum::<usize>();
            prop_assert_eq!(grouped + ungrouped_events(&g, &risk).len(), n_events);
            for d in &g.died {
                for &i in d {
                    prop_assert!(!censored[i]);
                }
            }
            for c in &g.censored {
                for &i in c {
                    prop_assert!(censored[i]);
                }
            }
        }
    }
}

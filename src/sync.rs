use std::collections::BTreeSet;

/// Changes needed to turn an observed set into a desired one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSteps<T: Ord> {
    /// Desired but not observed.
    pub add: BTreeSet<T>,
    /// Observed but not desired.
    pub delete: BTreeSet<T>,
    /// Both observed and desired.
    pub common: BTreeSet<T>,
}

impl<T: Ord> SyncSteps<T> {
    /// No additions and no deletions.
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.delete.is_empty()
    }
}

/// Computes the set difference between the observed remote state and the
/// desired local state. Duplicates collapse.
pub fn find_sync_steps<T, O, D>(observed: O, desired: D) -> SyncSteps<T>
where
    T: Ord + Clone,
    O: IntoIterator<Item = T>,
    D: IntoIterator<Item = T>,
{
    let observed: BTreeSet<T> = observed.into_iter().collect();
    let desired: BTreeSet<T> = desired.into_iter().collect();

    SyncSteps {
        add: desired.difference(&observed).cloned().collect(),
        delete: observed.difference(&desired).cloned().collect(),
        common: observed.intersection(&desired).cloned().collect(),
    }
}

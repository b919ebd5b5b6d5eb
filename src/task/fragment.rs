//! Compiled plan fragment: an ordered set of driver factories plus at most
//! one designated partitioned source. Planning/compilation of a fragment is
//! out of scope for this crate — a `Fragment` arrives already built.

use std::sync::Arc;

use crate::task::driver::DriverFactory;
use crate::task::types::PlanNodeId;

pub struct Fragment {
    pub factories: Vec<Arc<dyn DriverFactory>>,
    pub partitioned_source: Option<PlanNodeId>,
}

impl Fragment {
    pub fn new(factories: Vec<Arc<dyn DriverFactory>>, partitioned_source: Option<PlanNodeId>) -> Self {
        Self {
            factories,
            partitioned_source,
        }
    }

    /// The factory that consumes the fragment's partitioned source, if any.
    pub fn partitioned_factory(&self) -> Option<Arc<dyn DriverFactory>> {
        let source = self.partitioned_source.as_ref()?;
        self.factories
            .iter()
            .find(|f| f.source_ids().contains(source))
            .cloned()
    }

    /// Every factory other than the partitioned one: exactly one Driver is
    /// created from each, up front.
    pub fn unpartitioned_factories(&self) -> Vec<Arc<dyn DriverFactory>> {
        match &self.partitioned_source {
            None => self.factories.clone(),
            Some(source) => self
                .factories
                .iter()
                .filter(|f| !f.source_ids().contains(source))
                .cloned()
                .collect(),
        }
    }
}

use serde::{Deserialize, Serialize};

use crate::episode::AdditionalData;

/// Guest and topic metadata produced by the external enrichment collaborator.
///
/// The three guest arrays are order-correlated: index `i` of each describes
/// the same guest. Consumers must reject updates where the lengths diverge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentUpdate {
    pub guests: Vec<String>,
    pub guest_descriptions: Vec<String>,
    pub guest_image_urls: Vec<String>,
    pub topics: Vec<String>,
    /// Extra metadata merged into the episode's milestone ledger.
    #[serde(default)]
    pub extra_metadata: AdditionalData,
}

impl EnrichmentUpdate {
    /// True when the guest arrays are index-aligned.
    pub fn is_aligned(&self) -> bool {
        self.guests.len() == self.guest_descriptions.len()
            && self.guests.len() == self.guest_image_urls.len()
    }
}

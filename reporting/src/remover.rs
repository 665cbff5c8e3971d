//! Bulk deletion of browsing data by origin filter and type mask.

use crate::cache::ReportingCache;
use bitflags::bitflags;
use url::Url;

bitflags! {
    /// Which kinds of reporting data a removal covers.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DataTypeMask: u64 {
        const REPORTS = 1 << 0;
        const CLIENTS = 1 << 1;
    }
}

pub(crate) fn remove_browsing_data(
    cache: &mut ReportingCache,
    mask: DataTypeMask,
    origin_filter: &dyn Fn(&Url) -> bool,
) {
    if mask.contains(DataTypeMask::REPORTS) {
        cache.remove_reports_matching(origin_filter);
    }
    if mask.contains(DataTypeMask::CLIENTS) {
        cache.remove_clients_matching(origin_filter);
    }
}

pub(crate) fn remove_all_browsing_data(cache: &mut ReportingCache, mask: DataTypeMask) {
    remove_browsing_data(cache, mask, &|_| true);
}

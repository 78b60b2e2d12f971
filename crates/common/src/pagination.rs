//! Page-number windows for feed navigation.

/// Number of pages needed for `total_items` at `page_size` per page.
pub fn total_pages(total_items: u64, page_size: u32) -> u32 {
    if page_size == 0 {
        return 0;
    }
    let pages = total_items.div_ceil(u64::from(page_size));
    u32::try_from(pages).unwrap_or(u32::MAX)
}

/// Page numbers to show around `current_page`: at most `max_pages_to_show`
/// consecutive pages, centered on the current page and shifted to stay
/// within `1..=total_pages`.
pub fn get_pagination(current_page: u32, total_pages: u32, max_pages_to_show: u32) -> Vec<u32> {
    if total_pages == 0 || max_pages_to_show == 0 {
        return Vec::new();
    }
    if total_pages <= max_pages_to_show {
        return (1..=total_pages).collect();
    }

    // u64 so `start + max - 1` cannot overflow near u32::MAX.
    let total = u64::from(total_pages);
    let width = u64::from(max_pages_to_show);
    let half = width / 2;

    let mut start = u64::from(current_page).saturating_sub(half).max(1);
    let mut end = start + width - 1;
    if end > total {
        end = total;
        start = total - width + 1;
    }

    // Both bounds are within 1..=total_pages, so they fit in u32.
    (start as u32..=end as u32).collect()
}

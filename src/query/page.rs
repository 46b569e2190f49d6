use serde::Serialize;

/// Absolute cap on rows returned by one query.
pub const MAX_RESULT_ROWS: usize = 5000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub rows: Vec<T>,
    /// Size of the filtered set.
    pub total: usize,
    pub page: usize,
    pub pages: usize,
    pub page_size: usize,
    pub has_prev: bool,
    pub has_next: bool,
}

/// Slice one 1-indexed page out of `items`.
///
/// `page_size == 0` returns everything as a single page, truncated at
/// [`MAX_RESULT_ROWS`]. Out-of-range pages are clamped into `[1, pages]`.
pub fn paginate<T>(items: Vec<T>, page: usize, page_size: usize) -> Page<T> {
    let total = items.len();

    if page_size == 0 {
        let mut rows = items;
        rows.truncate(MAX_RESULT_ROWS);
        return Page {
            page_size: rows.len(),
            rows,
            total,
            page: 1,
            pages: 1,
            has_prev: false,
            has_next: false,
        };
    }

    let page_size = page_size.min(MAX_RESULT_ROWS);
    let pages = total.div_ceil(page_size).max(1);
    let page = page.clamp(1, pages);
    let rows: Vec<T> = items
        .into_iter()
        .skip((page - 1) * page_size)
        .take(page_size)
        .collect();

    Page {
        rows,
        total,
        page,
        pages,
        page_size,
        has_prev: page > 1,
        has_next: page < pages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_concatenate_to_full_set() {
        let items: Vec<usize> = (0..123).collect();
        let first = paginate(items.clone(), 1, 50);
        assert_eq!(first.pages, 3);

        let mut joined = Vec::new();
        for page in 1..=first.pages {
            joined.extend(paginate(items.clone(), page, 50).rows);
        }
        assert_eq!(joined, items);
    }

    #[test]
    fn test_page_metadata() {
        let items: Vec<usize> = (0..120).collect();
        let page = paginate(items, 2, 50);
        assert_eq!(page.rows.first(), Some(&50));
        assert_eq!(page.rows.last(), Some(&99));
        assert_eq!(page.total, 120);
        assert!(page.has_prev);
        assert!(page.has_next);
    }

    #[test]
    fn test_page_clamped() {
        let items: Vec<usize> = (0..10).collect();
        assert_eq!(paginate(items.clone(), 0, 4).page, 1);
        let last = paginate(items.clone(), 99, 4);
        assert_eq!(last.page, 3);
        assert_eq!(last.rows, vec![8, 9]);
        assert!(!last.has_next);

        let empty = paginate(Vec::<usize>::new(), 3, 10);
        assert_eq!((empty.page, empty.pages, empty.total), (1, 1, 0));
        assert!(empty.rows.is_empty());
    }

    #[test]
    fn test_zero_page_size_returns_all_up_to_cap() {
        let small = paginate((0..7).collect::<Vec<usize>>(), 5, 0);
        assert_eq!(small.rows.len(), 7);
        assert_eq!(small.pages, 1);

        let big = paginate((0..MAX_RESULT_ROWS + 10).collect::<Vec<usize>>(), 1, 0);
        assert_eq!(big.rows.len(), MAX_RESULT_ROWS);
        assert_eq!(big.total, MAX_RESULT_ROWS + 10);
    }
}

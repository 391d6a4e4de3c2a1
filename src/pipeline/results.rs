use std::collections::HashMap;
use parking_lot::Mutex;
use crate::models::ImageReference;

/// Matched images keyed by url. Each entry remembers its enumeration position
/// so the final list comes out in corpus order no matter which worker finished
/// first.
#[derive(Default)]
pub struct ResultCollector {
    matches: Mutex<HashMap<String, (usize, ImageReference)>>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the url was already collected; the first entry is kept.
    pub fn insert(&self, order: usize, image: ImageReference) -> bool {
        let mut guard = self.matches.lock();
        if guard.contains_key(&image.url) {
            return false;
        }
        guard.insert(image.url.clone(), (order, image));
        true
    }

    pub fn len(&self) -> usize { self.matches.lock().len() }
    pub fn is_empty(&self) -> bool { self.matches.lock().is_empty() }

    pub fn clear(&self) {
        self.matches.lock().clear();
    }

    pub fn sorted(&self) -> Vec<ImageReference> {
        let guard = self.matches.lock();
        let mut items: Vec<(usize, ImageReference)> = guard.values().cloned().collect();
        drop(guard);
        items.sort_by_key(|(order, _)| *order);
        items.into_iter().map(|(_, image)| image).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceCollection;

    fn image(url: &str, link: &str) -> ImageReference {
        ImageReference {
            url: url.to_string(),
            source_collection: SourceCollection::Gallery,
            source_link: link.to_string(),
        }
    }

    #[test]
    fn test_sorted_by_enumeration_order() {
        let c = ResultCollector::new();
        c.insert(9, image("i9", "/gallery/9"));
        c.insert(2, image("i2", "/gallery/2"));
        c.insert(5, image("i5", "/gallery/5"));
        let urls: Vec<String> = c.sorted().into_iter().map(|r| r.url).collect();
        assert_eq!(urls, vec!["i2", "i5", "i9"]);
    }

    #[test]
    fn test_duplicate_url_keeps_first() {
        let c = ResultCollector::new();
        assert!(c.insert(1, image("same", "/events/a")));
        assert!(!c.insert(4, image("same", "/gallery/4")));
        assert_eq!(c.len(), 1);
        assert_eq!(c.sorted()[0].source_link, "/events/a");
    }

    #[test]
    fn test_clear() {
        let c = ResultCollector::new();
        c.insert(0, image("a", "/gallery/1"));
        c.clear();
        assert!(c.is_empty());
        assert!(c.sorted().is_empty());
    }
}

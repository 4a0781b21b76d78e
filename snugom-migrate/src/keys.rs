/// Redis key construction for collections.
///
/// A collection is a single hash: `{prefix}:{collection}`, fields are
/// document ids.
#[derive(Debug, Clone)]
pub struct KeyContext<'a> {
    pub prefix: &'a str,
}

impl<'a> KeyContext<'a> {
    pub fn new(prefix: &'a str) -> Self {
        Self { prefix }
    }

    pub fn collection(&self, collection: &str) -> String {
        format!("{}:{}", self.prefix, collection)
    }

    /// Pattern matching every collection key under this prefix.
    pub fn collection_pattern(&self) -> String {
        format!("{}:*", self.prefix)
    }

    /// Collection name for a key produced by [`Self::collection`].
    pub fn collection_name<'k>(&self, key: &'k str) -> Option<&'k str> {
        key.strip_prefix(self.prefix)?.strip_prefix(':')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_collection_keys() {
        let ctx = KeyContext::new("snugom");
        assert_eq!(ctx.collection("DATABASECHANGELOG"), "snugom:DATABASECHANGELOG");
        assert_eq!(ctx.collection_pattern(), "snugom:*");
    }

    #[test]
    fn recovers_collection_names() {
        let ctx = KeyContext::new("app");
        assert_eq!(ctx.collection_name("app:users"), Some("users"));
        assert_eq!(ctx.collection_name("other:users"), None);
        assert_eq!(ctx.collection_name("appusers"), None);
    }
}

pub mod article_list;
pub mod attachments;
pub mod bundle;
pub mod category_cache;
pub mod category_tree;
pub mod config;
pub mod doc_export;
pub mod fetch;
pub mod iframe;
pub mod markup;
pub mod migrate;
pub mod rate_limit;
pub mod record;
pub mod report;
pub mod runtime;
pub mod store;
pub mod translation;

#[cfg(test)]
pub(crate) mod test_support;

use std::collections::HashSet;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::record::{
    ARTICLE_TABLE, ArticleRecord, Lookup, STATE_OUTDATED, STATE_PUBLISHED,
    TRANSLATION_FIELDS,
};
use crate::store::{RecordQuery, RecordStore, query_all};

/// Locale ordering for merged documents and family filenames: primary first,
/// secondary next, everything else alphabetically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalePriority {
    pub primary: String,
    pub secondary: String,
}

impl Default for LocalePriority {
    fn default() -> Self {
        Self::new("ja", "en")
    }
}

impl LocalePriority {
    pub fn new(primary: &str, secondary: &str) -> Self {
        Self {
            primary: primary.trim().to_string(),
            secondary: secondary.trim().to_string(),
        }
    }

    /// Language code of a record; records without one belong to the primary locale.
    pub fn normalize<'a>(&'a self, language: &'a str) -> &'a str {
        let trimmed = language.trim();
        if trimmed.is_empty() {
            &self.primary
        } else {
            trimmed
        }
    }

    pub fn rank<'a>(&'a self, language: &'a str) -> (u8, &'a str) {
        let code = self.normalize(language);
        let group = if code == self.primary {
            0
        } else if code == self.secondary {
            1
        } else {
            2
        };
        (group, code)
    }

    /// Stable locale sort of any family-shaped slice.
    pub fn sort_by_locale<T, F>(&self, items: &mut [T], language: F)
    where
        F: Fn(&T) -> &str,
    {
        items.sort_by(|left, right| self.rank(language(left)).cmp(&self.rank(language(right))));
    }
}

pub fn locale_name(code: &str) -> String {
    match code {
        "ja" => "Japanese".to_string(),
        "en" => "English".to_string(),
        "zh" => "Chinese".to_string(),
        "ko" => "Korean".to_string(),
        "es" => "Spanish".to_string(),
        "fr" => "French".to_string(),
        "de" => "German".to_string(),
        "it" => "Italian".to_string(),
        "pt" => "Portuguese".to_string(),
        "ru" => "Russian".to_string(),
        other => other.to_uppercase(),
    }
}

/// One localized body taking part in a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSection<'a> {
    pub language: &'a str,
    pub html: &'a str,
}

/// Concatenate every section in locale order as labeled blocks separated by rules.
pub fn merge_sections(locales: &LocalePriority, sections: &[MergeSection<'_>]) -> String {
    let mut ordered = sections.to_vec();
    locales.sort_by_locale(&mut ordered, |section| section.language);

    let mut parts = Vec::with_capacity(ordered.len() * 5);
    for (index, section) in ordered.iter().enumerate() {
        let code = locales.normalize(section.language);
        parts.push(format!(
            "<div class=\"article-section\" data-language=\"{code}\">"
        ));
        parts.push(format!(
            "<h2 class=\"language-header\">{}</h2>",
            locale_name(code)
        ));
        parts.push(section.html.to_string());
        parts.push("</div>".to_string());
        if index + 1 < ordered.len() {
            parts.push("<hr class=\"language-separator\" />".to_string());
        }
    }
    parts.join("\n")
}

pub fn merge_articles(
    locales: &LocalePriority,
    original: &ArticleRecord,
    translations: &[ArticleRecord],
) -> String {
    let sections = std::iter::once(original)
        .chain(translations)
        .map(|article| MergeSection {
            language: &article.language,
            html: &article.text,
        })
        .collect::<Vec<_>>();
    merge_sections(locales, &sections)
}

/// Which branch of the discovery chain produced a translation family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryPath {
    Direct,
    SiblingsOfLatest,
    LatestVersion,
    ChildrenOfVersions,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationFamily {
    pub path: DiscoveryPath,
    pub translations: Vec<ArticleRecord>,
}

pub struct TranslationResolver<'a, S: RecordStore + ?Sized> {
    store: &'a S,
    locales: &'a LocalePriority,
    page_size: usize,
}

impl<'a, S: RecordStore + ?Sized> TranslationResolver<'a, S> {
    pub fn new(store: &'a S, locales: &'a LocalePriority, page_size: usize) -> Self {
        Self {
            store,
            locales,
            page_size,
        }
    }

    /// Translations of an article. Discovery errors are logged and yield an
    /// empty family so the article still exports on its own.
    pub fn find_translations(&self, sys_id: &str) -> Vec<ArticleRecord> {
        match self.discover(sys_id) {
            Ok(family) => {
                info!(sys_id, count = family.translations.len(), path = ?family.path, "resolved translations");
                family.translations
            }
            Err(error) => {
                error!(sys_id, error = %format!("{error:#}"), "translation discovery failed");
                Vec::new()
            }
        }
    }

    pub fn discover(&self, sys_id: &str) -> Result<TranslationFamily> {
        let direct = self.query(format!(
            "parent={sys_id}^ORtranslated_from={sys_id}^workflow_state={STATE_PUBLISHED}"
        ))?;
        let direct = dedupe(direct, sys_id);
        if !direct.is_empty() {
            return Ok(TranslationFamily {
                path: DiscoveryPath::Direct,
                translations: direct,
            });
        }
        self.discover_siblings(sys_id)
    }

    fn discover_siblings(&self, sys_id: &str) -> Result<TranslationFamily> {
        let Lookup::Found(current) = self.store.get_record(
            ARTICLE_TABLE,
            sys_id,
            &["sys_id", "number", "parent", "language"],
        )?
        else {
            return Ok(empty_family());
        };
        let current = ArticleRecord::from_record(&current);

        match current.parent_id.clone() {
            Some(parent_id) => self.discover_via_parent(&current, &parent_id),
            None => self.discover_children_of_versions(&current),
        }
    }

    fn discover_via_parent(
        &self,
        current: &ArticleRecord,
        parent_id: &str,
    ) -> Result<TranslationFamily> {
        let Lookup::Found(parent) = self.store.get_record(
            ARTICLE_TABLE,
            parent_id,
            &["sys_id", "number", "workflow_state", "language"],
        )?
        else {
            return Ok(empty_family());
        };
        let parent = ArticleRecord::from_record(&parent);
        if parent.workflow_state != STATE_OUTDATED {
            return Ok(empty_family());
        }
        debug!(number = %parent.number, "parent is outdated, looking for latest version");

        let latest = self.store.query_records(
            &RecordQuery::new(
                ARTICLE_TABLE,
                format!(
                    "number={}^workflow_state={STATE_PUBLISHED}^ORDERBYDESCsys_updated_on",
                    parent.number
                ),
            )
            .fields(&["sys_id", "language"])
            .limit(1),
        )?;
        let Some(latest) = latest.first().map(ArticleRecord::from_record) else {
            return Ok(empty_family());
        };

        if latest.sys_id == current.sys_id {
            let siblings = self.children_of(parent_id, &current.sys_id)?;
            return Ok(TranslationFamily {
                path: DiscoveryPath::SiblingsOfLatest,
                translations: self.other_languages(siblings, &current.language),
            });
        }

        if self.locales.normalize(&latest.language) == self.locales.normalize(&current.language) {
            return Ok(empty_family());
        }
        let translations = match self
            .store
            .get_record(ARTICLE_TABLE, &latest.sys_id, TRANSLATION_FIELDS)?
        {
            Lookup::Found(record) => vec![ArticleRecord::from_record(&record)],
            Lookup::NotFound => Vec::new(),
        };
        Ok(TranslationFamily {
            path: DiscoveryPath::LatestVersion,
            translations,
        })
    }

    fn discover_children_of_versions(&self, current: &ArticleRecord) -> Result<TranslationFamily> {
        if current.number.is_empty() {
            return Ok(empty_family());
        }
        let versions = query_all(
            self.store,
            &RecordQuery::new(ARTICLE_TABLE, format!("number={}", current.number))
                .fields(&["sys_id"]),
            self.page_size,
        )?;
        debug!(number = %current.number, versions = versions.len(), "searching children of all versions");

        let mut children = Vec::new();
        for version in &versions {
            let version_id = version.sys_id().trim();
            if version_id.is_empty() {
                continue;
            }
            children.extend(self.children_of(version_id, &current.sys_id)?);
        }
        let children = dedupe(children, &current.sys_id);
        Ok(TranslationFamily {
            path: DiscoveryPath::ChildrenOfVersions,
            translations: self.other_languages(children, &current.language),
        })
    }

    fn children_of(&self, parent_id: &str, exclude: &str) -> Result<Vec<ArticleRecord>> {
        let records = self.query(format!(
            "parent={parent_id}^workflow_state={STATE_PUBLISHED}^sys_id!={exclude}"
        ))?;
        Ok(records)
    }

    fn query(&self, filter: String) -> Result<Vec<ArticleRecord>> {
        let records = query_all(
            self.store,
            &RecordQuery::new(ARTICLE_TABLE, filter).fields(TRANSLATION_FIELDS),
            self.page_size,
        )?;
        Ok(records.iter().map(ArticleRecord::from_record).collect())
    }

    fn other_languages(&self, records: Vec<ArticleRecord>, language: &str) -> Vec<ArticleRecord> {
        let current = self.locales.normalize(language).to_string();
        records
            .into_iter()
            .filter(|record| self.locales.normalize(&record.language) != current)
            .collect()
    }
}

fn empty_family() -> TranslationFamily {
    TranslationFamily {
        path: DiscoveryPath::None,
        translations: Vec::new(),
    }
}

/// Drop repeats and the article itself, keeping first occurrences.
fn dedupe(records: Vec<ArticleRecord>, self_id: &str) -> Vec<ArticleRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| record.sys_id != self_id && seen.insert(record.sys_id.clone()))
        .collect()
}

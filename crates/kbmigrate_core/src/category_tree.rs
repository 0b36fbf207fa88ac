use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::Serialize;
use tracing::{info, warn};

use crate::record::Record;

pub const PATH_SEPARATOR: &str = " > ";

/// Category path of a record: the `kb_category` label, falling back to its raw value.
pub fn category_path_of(record: &Record) -> String {
    record.display("kb_category").trim().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryNode {
    pub name: String,
    pub full_path: String,
    pub parent_path: Option<String>,
    pub ancestors: Vec<String>,
    pub level: usize,
    pub direct_article_count: usize,
    pub total_article_count: usize,
    #[serde(skip)]
    pub parent: Option<usize>,
    #[serde(skip)]
    pub children: Vec<usize>,
}

/// Flat row of the category table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlatCategory {
    pub name: String,
    pub full_path: String,
    pub parent: String,
    /// Ancestor paths, root first, joined with the path separator.
    pub ancestors: String,
    pub level: usize,
    pub article_count: usize,
    pub total_article_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NestedCategory {
    pub name: String,
    pub full_path: String,
    pub level: usize,
    pub article_count: usize,
    pub total_article_count: usize,
    pub children: Vec<NestedCategory>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    pub total_categories: usize,
    pub max_depth: usize,
    pub top_categories: Vec<FlatCategory>,
    pub articles_with_category: usize,
    pub articles_without_category: usize,
}

/// Arena of category nodes keyed by full path. Built once, read-only after.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryForest {
    nodes: Vec<CategoryNode>,
    roots: Vec<usize>,
    index: BTreeMap<String, usize>,
    warnings: Vec<String>,
    articles_with_category: usize,
    articles_without_category: usize,
}

pub fn build_category_forest<I, P>(paths: I) -> CategoryForest
where
    I: IntoIterator<Item = P>,
    P: AsRef<str>,
{
    let mut direct_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut with_category = 0usize;
    let mut without_category = 0usize;

    for path in paths {
        let segments = split_path(path.as_ref());
        if segments.is_empty() {
            without_category += 1;
            continue;
        }
        with_category += 1;
        *direct_counts
            .entry(segments.join(PATH_SEPARATOR))
            .or_default() += 1;
    }

    let mut all_paths = BTreeSet::new();
    for path in direct_counts.keys() {
        let segments = split_path(path);
        for depth in 1..=segments.len() {
            all_paths.insert(segments[..depth].join(PATH_SEPARATOR));
        }
    }

    let mut forest = assemble(all_paths, &direct_counts);
    forest.articles_with_category = with_category;
    forest.articles_without_category = without_category;
    info!(
        categories = forest.nodes.len(),
        roots = forest.roots.len(),
        "built category hierarchy"
    );
    forest
}

pub fn build_category_forest_from_records(records: &[Record]) -> CategoryForest {
    build_category_forest(records.iter().map(category_path_of))
}

fn split_path(path: &str) -> Vec<&str> {
    path.split(PATH_SEPARATOR.trim())
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect()
}

fn assemble(paths: BTreeSet<String>, direct_counts: &BTreeMap<String, usize>) -> CategoryForest {
    let mut sorted = paths.into_iter().collect::<Vec<_>>();
    sorted.sort_by(|left, right| {
        depth_of(left)
            .cmp(&depth_of(right))
            .then_with(|| left.cmp(right))
    });

    let mut forest = CategoryForest::default();
    for path in sorted {
        let segments = split_path(&path);
        let name = segments.last().copied().unwrap_or_default().to_string();
        let ancestors = (1..segments.len())
            .map(|depth| segments[..depth].join(PATH_SEPARATOR))
            .collect::<Vec<_>>();
        let parent_path = ancestors.last().cloned();
        let direct = direct_counts.get(&path).copied().unwrap_or(0);

        let id = forest.nodes.len();
        let parent = match &parent_path {
            Some(parent_path) => match forest.index.get(parent_path) {
                Some(parent) => Some(*parent),
                None => {
                    warn!(path = %path, parent = %parent_path, "parent category missing, promoting to root");
                    forest
                        .warnings
                        .push(format!("parent path not found for {path}: {parent_path}"));
                    None
                }
            },
            None => None,
        };

        // Level follows the assembled tree: a promoted root restarts at 0.
        let level = parent.map_or(0, |parent| forest.nodes[parent].level + 1);

        forest.nodes.push(CategoryNode {
            name,
            full_path: path.clone(),
            parent_path,
            ancestors,
            level,
            direct_article_count: direct,
            total_article_count: direct,
            parent,
            children: Vec::new(),
        });
        forest.index.insert(path, id);
        match parent {
            Some(parent) => forest.nodes[parent].children.push(id),
            None => forest.roots.push(id),
        }
    }

    // Nodes were inserted shallowest first, so walking backwards finalizes
    // every child before its parent.
    for id in (0..forest.nodes.len()).rev() {
        if let Some(parent) = forest.nodes[id].parent {
            let total = forest.nodes[id].total_article_count;
            forest.nodes[parent].total_article_count += total;
        }
    }

    forest
}

fn depth_of(path: &str) -> usize {
    split_path(path).len()
}

impl CategoryForest {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[CategoryNode] {
        &self.nodes
    }

    pub fn roots(&self) -> impl Iterator<Item = &CategoryNode> {
        self.roots.iter().map(|id| &self.nodes[*id])
    }

    pub fn get(&self, full_path: &str) -> Option<&CategoryNode> {
        self.index.get(full_path).map(|id| &self.nodes[*id])
    }

    pub fn children<'a>(&'a self, node: &'a CategoryNode) -> impl Iterator<Item = &'a CategoryNode> {
        node.children.iter().map(|id| &self.nodes[*id])
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Every category ordered by full path.
    pub fn flat(&self) -> Vec<FlatCategory> {
        self.index
            .values()
            .map(|id| flat_row(&self.nodes[*id]))
            .collect()
    }

    pub fn nested(&self) -> Vec<NestedCategory> {
        self.roots.iter().map(|id| self.nest(*id)).collect()
    }

    fn nest(&self, id: usize) -> NestedCategory {
        let node = &self.nodes[id];
        NestedCategory {
            name: node.name.clone(),
            full_path: node.full_path.clone(),
            level: node.level,
            article_count: node.direct_article_count,
            total_article_count: node.total_article_count,
            children: node.children.iter().map(|child| self.nest(*child)).collect(),
        }
    }

    pub fn stats(&self) -> CategoryStats {
        let mut top_categories = self.roots().map(flat_row).collect::<Vec<_>>();
        top_categories.sort_by(|left, right| {
            right
                .total_article_count
                .cmp(&left.total_article_count)
                .then_with(|| left.full_path.cmp(&right.full_path))
        });
        CategoryStats {
            total_categories: self.nodes.len(),
            max_depth: self
                .nodes
                .iter()
                .map(|node| node.level + 1)
                .max()
                .unwrap_or(0),
            top_categories,
            articles_with_category: self.articles_with_category,
            articles_without_category: self.articles_without_category,
        }
    }

    /// Indented text rendering, one category per line.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        for root in &self.roots {
            self.render_node(*root, &mut out);
        }
        out
    }

    fn render_node(&self, id: usize, out: &mut String) {
        let node = &self.nodes[id];
        let _ = writeln!(
            out,
            "{}{} ({} direct, {} total)",
            "  ".repeat(node.level),
            node.name,
            node.direct_article_count,
            node.total_article_count
        );
        for child in &node.children {
            self.render_node(*child, out);
        }
    }
}

fn flat_row(node: &CategoryNode) -> FlatCategory {
    FlatCategory {
        name: node.name.clone(),
        full_path: node.full_path.clone(),
        parent: node.parent_path.clone().unwrap_or_default(),
        ancestors: node.ancestors.join(PATH_SEPARATOR),
        level: node.level,
        article_count: node.direct_article_count,
        total_article_count: node.total_article_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CategoryForest {
        build_category_forest([
            "IT > Applications > Figma",
            "IT > Applications > Slack",
            "IT > Applications > Slack",
            "IT > Hardware",
            "IT",
            "HR > Benefits",
            "",
        ])
    }

    #[test]
    fn every_prefix_becomes_a_node() {
        let forest = sample();
        let applications = forest.get("IT > Applications").expect("node");
        assert_eq!(applications.direct_article_count, 0);
        assert_eq!(applications.level, 1);
        assert_eq!(applications.parent_path.as_deref(), Some("IT"));
        assert_eq!(forest.get("HR").expect("HR").direct_article_count, 0);
        assert!(forest.warnings().is_empty());
    }

    #[test]
    fn totals_equal_direct_plus_descendants() {
        let forest = sample();
        for node in forest.nodes() {
            let children_total: usize = forest
                .children(node)
                .map(|child| child.total_article_count)
                .sum();
            assert_eq!(
                node.total_article_count,
                node.direct_article_count + children_total
            );
        }
        assert_eq!(forest.get("IT").expect("IT").total_article_count, 5);
    }

    #[test]
    fn ancestors_are_root_first() {
        let forest = sample();
        let figma = forest.get("IT > Applications > Figma").expect("node");
        assert_eq!(figma.ancestors, vec!["IT", "IT > Applications"]);
    }

    #[test]
    fn missing_parent_promotes_node_to_root() {
        let mut counts = BTreeMap::new();
        counts.insert("A > B".to_string(), 2);
        let forest = assemble(BTreeSet::from(["A > B".to_string()]), &counts);
        assert_eq!(forest.roots().count(), 1);
        assert_eq!(forest.warnings().len(), 1);
        assert_eq!(forest.get("A > B").expect("node").total_article_count, 2);
    }

    #[test]
    fn promoted_root_starts_at_level_zero() {
        let mut counts = BTreeMap::new();
        counts.insert("A > B > C".to_string(), 1);
        let paths = BTreeSet::from(["A > B".to_string(), "A > B > C".to_string()]);
        let forest = assemble(paths, &counts);
        let promoted = forest.get("A > B").expect("node");
        assert_eq!(promoted.level, 0);
        assert_eq!(forest.get("A > B > C").expect("node").level, 1);
        assert_eq!(forest.roots().map(|root| root.level).collect::<Vec<_>>(), vec![0]);
        assert_eq!(forest.stats().max_depth, 2);
        assert_eq!(forest.render_tree(), "B (0 direct, 1 total)\n  C (1 direct, 1 total)\n");
    }

    #[test]
    fn flat_rows_carry_joined_ancestors() {
        let flat = sample().flat();
        let figma = flat
            .iter()
            .find(|row| row.full_path == "IT > Applications > Figma")
            .expect("figma row");
        assert_eq!(figma.ancestors, "IT > IT > Applications");
        let root = flat.iter().find(|row| row.full_path == "IT").expect("root row");
        assert_eq!(root.ancestors, "");
    }

    #[test]
    fn stats_rank_top_level_by_total() {
        let stats = sample().stats();
        assert_eq!(stats.total_categories, 7);
        assert_eq!(stats.max_depth, 3);
        assert_eq!(stats.top_categories[0].full_path, "IT");
        assert_eq!(stats.articles_with_category, 6);
        assert_eq!(stats.articles_without_category, 1);
    }

    #[test]
    fn reference_labels_are_used_as_paths() {
        let record = Record::default().with_reference("kb_category", "c9", "IT > VPN");
        let forest = build_category_forest_from_records(&[record]);
        assert!(forest.get("IT > VPN").is_some());
    }

    #[test]
    fn tree_rendering_indents_by_level() {
        let rendered = build_category_forest(["IT > VPN"]).render_tree();
        assert_eq!(rendered, "IT (0 direct, 1 total)\n  VPN (1 direct, 1 total)\n");
    }
}

//! Seller → seller-category lookup.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::NormalizeError;

#[derive(Debug, Clone, Deserialize)]
struct SellerCategoriesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<SellerCategoryRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct SellerCategoryRule {
    category: String,
    sellers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SellerCategories {
    by_seller: HashMap<String, String>,
}

impl Default for SellerCategories {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SellerCategories {
    pub fn builtin() -> Self {
        Self::from_pairs([
            ("Enisa", "Delivery"),
            ("Dea", "Delivery"),
            ("Kristian Llupo", "Bar"),
            ("Pranvera Xherahi", "Bar"),
            ("Fjorelo Arapi", "Restaurant"),
            ("Jonel Demba", "Restaurant"),
        ])
    }

    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self {
            by_seller: pairs
                .into_iter()
                .map(|(seller, category)| (seller.trim().to_string(), category.to_string()))
                .collect(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        let file: SellerCategoriesFile = serde_yaml::from_str(text)?;
        let mut by_seller = HashMap::new();
        for rule in file.rules {
            for seller in rule.sellers {
                by_seller.insert(seller.trim().to_string(), rule.category.clone());
            }
        }
        Ok(Self { by_seller })
    }

    pub fn from_path(path: &Path) -> Result<Self, NormalizeError> {
        let text = std::fs::read_to_string(path).map_err(|source| NormalizeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text).map_err(|source| NormalizeError::Categories {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Exact match on the trimmed seller name.
    pub fn category_for(&self, seller: &str) -> Option<&str> {
        self.by_seller.get(seller.trim()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_seller.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_seller.is_empty()
    }
}

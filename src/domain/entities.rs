//! Storefront content records served by the remote configuration service.
//!
//! Fields the storefront does not understand are ignored on decode so that
//! backend additions never turn into fetch failures.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Theme {
    pub primary_color: String,
    pub secondary_color: String,
    pub accent_color: String,
    pub background_color: String,
    pub text_color: String,
    pub font_family: String,
    pub mode: ThemeMode,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            primary_color: "#1f2937".to_string(),
            secondary_color: "#4b5563".to_string(),
            accent_color: "#f59e0b".to_string(),
            background_color: "#ffffff".to_string(),
            text_color: "#111827".to_string(),
            font_family: "system-ui, sans-serif".to_string(),
            mode: ThemeMode::Light,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    #[default]
    Light,
    Dark,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Banner {
    pub id: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub image_url: String,
    pub link_url: Option<String>,
    pub position: i32,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Footer {
    pub copyright: String,
    pub columns: Vec<FooterColumn>,
    pub social_links: Vec<FooterLink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FooterColumn {
    pub heading: String,
    pub links: Vec<FooterLink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FooterLink {
    pub label: String,
    pub href: String,
}

/// A block on the storefront home page. `kind` selects the renderer
/// (carousel, product grid, brand strip, ...); `settings` is renderer-specific.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HomepageSection {
    pub id: String,
    pub kind: String,
    pub title: Option<String>,
    pub position: i32,
    pub visible: bool,
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Brand {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub logo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub parent_id: Option<String>,
    pub image_url: Option<String>,
    pub position: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Logo {
    pub url: String,
    pub alt: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Default for Logo {
    fn default() -> Self {
        Self {
            url: "/static/logo.svg".to_string(),
            alt: "Store".to_string(),
            width: None,
            height: None,
        }
    }
}

/// A CMS-managed static page such as `/about` or `/shipping`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticPage {
    pub path: String,
    pub title: String,
    pub body_html: String,
    pub meta_description: Option<String>,
}

impl StaticPage {
    pub fn empty(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Default::default()
        }
    }
}

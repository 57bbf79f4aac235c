//! Resource and context identifiers shared by the cache and its collaborators.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::entities::{
    Banner, Brand, Category, Footer, HomepageSection, Logo, StaticPage, Theme,
};
use crate::domain::error::ConfigError;

/// Payload-free discriminant of [`ResourceType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Theme,
    Banners,
    Footer,
    HomepageSections,
    Brands,
    Categories,
    Logo,
    Page,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 8] = [
        ResourceKind::Theme,
        ResourceKind::Banners,
        ResourceKind::Footer,
        ResourceKind::HomepageSections,
        ResourceKind::Brands,
        ResourceKind::Categories,
        ResourceKind::Logo,
        ResourceKind::Page,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Theme => "theme",
            ResourceKind::Banners => "banners",
            ResourceKind::Footer => "footer",
            ResourceKind::HomepageSections => "homepage_sections",
            ResourceKind::Brands => "brands",
            ResourceKind::Categories => "categories",
            ResourceKind::Logo => "logo",
            ResourceKind::Page => "page",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| ConfigError::unknown_resource_type(value))
    }
}

/// One cacheable resource. `Page` is keyed by its site path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ResourceType {
    Theme,
    Banners,
    Footer,
    HomepageSections,
    Brands,
    Categories,
    Logo,
    Page(String),
}

impl ResourceType {
    /// Resource types with a fixed identity, i.e. everything except pages.
    pub const SINGLETONS: [ResourceType; 7] = [
        ResourceType::Theme,
        ResourceType::Banners,
        ResourceType::Footer,
        ResourceType::HomepageSections,
        ResourceType::Brands,
        ResourceType::Categories,
        ResourceType::Logo,
    ];

    pub fn page(path: impl Into<String>) -> Self {
        ResourceType::Page(path.into())
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceType::Theme => ResourceKind::Theme,
            ResourceType::Banners => ResourceKind::Banners,
            ResourceType::Footer => ResourceKind::Footer,
            ResourceType::HomepageSections => ResourceKind::HomepageSections,
            ResourceType::Brands => ResourceKind::Brands,
            ResourceType::Categories => ResourceKind::Categories,
            ResourceType::Logo => ResourceKind::Logo,
            ResourceType::Page(_) => ResourceKind::Page,
        }
    }

    /// The value served before the first successful fetch.
    pub fn fallback(&self) -> ResourceValue {
        match self {
            ResourceType::Theme => ResourceValue::Theme(Theme::default()),
            ResourceType::Banners => ResourceValue::Banners(Vec::new()),
            ResourceType::Footer => ResourceValue::Footer(Footer::default()),
            ResourceType::HomepageSections => ResourceValue::HomepageSections(Vec::new()),
            ResourceType::Brands => ResourceValue::Brands(Vec::new()),
            ResourceType::Categories => ResourceValue::Categories(Vec::new()),
            ResourceType::Logo => ResourceValue::Logo(Logo::default()),
            ResourceType::Page(path) => ResourceValue::Page(StaticPage::empty(path)),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Page(path) => write!(f, "page:{path}"),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

impl FromStr for ResourceType {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if let Some(path) = value.strip_prefix("page:") {
            return Ok(ResourceType::Page(path.to_string()));
        }

        match value.parse::<ResourceKind>()? {
            ResourceKind::Theme => Ok(ResourceType::Theme),
            ResourceKind::Banners => Ok(ResourceType::Banners),
            ResourceKind::Footer => Ok(ResourceType::Footer),
            ResourceKind::HomepageSections => Ok(ResourceType::HomepageSections),
            ResourceKind::Brands => Ok(ResourceType::Brands),
            ResourceKind::Categories => Ok(ResourceType::Categories),
            ResourceKind::Logo => Ok(ResourceType::Logo),
            ResourceKind::Page => Err(ConfigError::unknown_resource_type(value)),
        }
    }
}

impl From<ResourceType> for String {
    fn from(value: ResourceType) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for ResourceType {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A named consumer profile of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextName {
    Storefront,
    Admin,
    Delivery,
    Shared,
}

impl ContextName {
    pub const ALL: [ContextName; 4] = [
        ContextName::Storefront,
        ContextName::Admin,
        ContextName::Delivery,
        ContextName::Shared,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ContextName::Storefront => "storefront",
            ContextName::Admin => "admin",
            ContextName::Delivery => "delivery",
            ContextName::Shared => "shared",
        }
    }
}

impl fmt::Display for ContextName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextName {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ContextName::ALL
            .into_iter()
            .find(|context| context.as_str() == value)
            .ok_or_else(|| ConfigError::unknown_context(value))
    }
}

/// A cached resource payload, one variant per [`ResourceKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ResourceValue {
    Theme(Theme),
    Banners(Vec<Banner>),
    Footer(Footer),
    HomepageSections(Vec<HomepageSection>),
    Brands(Vec<Brand>),
    Categories(Vec<Category>),
    Logo(Logo),
    Page(StaticPage),
}

impl ResourceValue {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceValue::Theme(_) => ResourceKind::Theme,
            ResourceValue::Banners(_) => ResourceKind::Banners,
            ResourceValue::Footer(_) => ResourceKind::Footer,
            ResourceValue::HomepageSections(_) => ResourceKind::HomepageSections,
            ResourceValue::Brands(_) => ResourceKind::Brands,
            ResourceValue::Categories(_) => ResourceKind::Categories,
            ResourceValue::Logo(_) => ResourceKind::Logo,
            ResourceValue::Page(_) => ResourceKind::Page,
        }
    }

    /// Decode a raw backend payload into the variant matching `resource`.
    pub fn from_json(
        resource: &ResourceType,
        payload: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(match resource {
            ResourceType::Theme => ResourceValue::Theme(serde_json::from_value(payload)?),
            ResourceType::Banners => ResourceValue::Banners(serde_json::from_value(payload)?),
            ResourceType::Footer => ResourceValue::Footer(serde_json::from_value(payload)?),
            ResourceType::HomepageSections => {
                ResourceValue::HomepageSections(serde_json::from_value(payload)?)
            }
            ResourceType::Brands => ResourceValue::Brands(serde_json::from_value(payload)?),
            ResourceType::Categories => {
                ResourceValue::Categories(serde_json::from_value(payload)?)
            }
            ResourceType::Logo => ResourceValue::Logo(serde_json::from_value(payload)?),
            ResourceType::Page(path) => {
                let mut page: StaticPage = serde_json::from_value(payload)?;
                if page.path.is_empty() {
                    page.path = path.clone();
                }
                ResourceValue::Page(page)
            }
        })
    }
}

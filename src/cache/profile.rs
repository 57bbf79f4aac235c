//! Static context profiles: which resource types each UI surface needs.

use crate::domain::types::{ContextName, ResourceType};

const STOREFRONT: &[ResourceType] = &[
    ResourceType::Theme,
    ResourceType::Banners,
    ResourceType::Footer,
    ResourceType::HomepageSections,
    ResourceType::Brands,
    ResourceType::Categories,
    ResourceType::Logo,
];

const ADMIN: &[ResourceType] = &[ResourceType::Theme, ResourceType::Footer, ResourceType::Logo];

const DELIVERY: &[ResourceType] = &[ResourceType::Theme, ResourceType::Logo];

const SHARED: &[ResourceType] = &[ResourceType::Theme, ResourceType::Logo];

/// Resource types `context` requires. Pages are fetched on demand and never listed.
pub fn required_resources(context: ContextName) -> &'static [ResourceType] {
    match context {
        ContextName::Storefront => STOREFRONT,
        ContextName::Admin => ADMIN,
        ContextName::Delivery => DELIVERY,
        ContextName::Shared => SHARED,
    }
}

/// Every context whose profile lists `resource`.
pub fn contexts_requiring(resource: &ResourceType) -> impl Iterator<Item = ContextName> + '_ {
    ContextName::ALL
        .into_iter()
        .filter(move |context| required_resources(*context).contains(resource))
}

/// Union of all profiles, in first-seen order.
pub fn all_profiled_resources() -> Vec<ResourceType> {
    let mut resources: Vec<ResourceType> = Vec::new();
    for context in ContextName::ALL {
        for resource in required_resources(context) {
            if !resources.contains(resource) {
                resources.push(resource.clone());
            }
        }
    }
    resources
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_profile_is_theme_footer_logo() {
        assert_eq!(
            required_resources(ContextName::Admin),
            &[ResourceType::Theme, ResourceType::Footer, ResourceType::Logo]
        );
    }

    #[test]
    fn theme_is_required_everywhere() {
        let contexts: Vec<ContextName> = contexts_requiring(&ResourceType::Theme).collect();
        assert_eq!(contexts, ContextName::ALL.to_vec());
    }

    #[test]
    fn banners_belong_to_storefront_only() {
        let contexts: Vec<ContextName> = contexts_requiring(&ResourceType::Banners).collect();
        assert_eq!(contexts, vec![ContextName::Storefront]);
    }

    #[test]
    fn pages_have_no_static_owner() {
        assert_eq!(contexts_requiring(&ResourceType::page("/about")).count(), 0);
    }

    #[test]
    fn union_covers_every_singleton() {
        let all = all_profiled_resources();
        for resource in ResourceType::SINGLETONS {
            assert!(all.contains(&resource), "missing {resource}");
        }
    }
}

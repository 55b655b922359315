//! Routing rule synthesis.
//!
//! The routing plugin turns the surviving server set plus user-declared
//! routes into an engine-neutral rule list. Exporters translate the result
//! into target syntax (rule actions for modern sing-box, legacy outbound
//! references otherwise).

use sboxpipe_types::{ParsedServer, PipelineMode, RouteRuleSpec};

/// Tag of the auto-select group exporters emit.
pub const URLTEST_TAG: &str = "auto";

/// One engine-neutral routing rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRule {
    pub domain_suffix: Vec<String>,
    pub ip_cidr: Vec<String>,
    pub protocol: Option<String>,
    /// Destination outbound tag, or the DNS hijack action.
    pub target: RouteTarget,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteTarget {
    Outbound(String),
    HijackDns,
}

/// Complete routing decision handed to the exporter.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingConfig {
    pub rules: Vec<RouteRule>,
    /// Final outbound tag; `auto` resolves to the urltest group.
    pub final_outbound: String,
    /// Whether the exporter must emit a urltest group.
    pub needs_urltest: bool,
}

/// Produces a rule set from servers, user routes and exclusions.
pub trait RoutingPlugin: Send + Sync {
    fn build(
        &self,
        servers: &[ParsedServer],
        user_routes: &[RouteRuleSpec],
        final_override: Option<&str>,
        mode: PipelineMode,
    ) -> RoutingConfig;
}

/// Default router: DNS hijack first, then user routes in declaration
/// order, finishing on the configured final outbound.
pub struct DefaultRouter;

impl RoutingPlugin for DefaultRouter {
    fn build(
        &self,
        servers: &[ParsedServer],
        user_routes: &[RouteRuleSpec],
        final_override: Option<&str>,
        _mode: PipelineMode,
    ) -> RoutingConfig {
        let mut rules = vec![RouteRule {
            domain_suffix: Vec::new(),
            ip_cidr: Vec::new(),
            protocol: Some("dns".to_string()),
            target: RouteTarget::HijackDns,
        }];

        for spec in user_routes {
            rules.push(RouteRule {
                domain_suffix: spec.domain_suffix.clone(),
                ip_cidr: spec.ip_cidr.clone(),
                protocol: spec.protocol.clone(),
                target: RouteTarget::Outbound(spec.outbound.clone()),
            });
        }

        let final_outbound = final_override.unwrap_or(URLTEST_TAG).to_string();
        // A urltest group only makes sense with at least one real server.
        let needs_urltest = servers.iter().any(|s| !s.protocol.is_virtual());

        RoutingConfig {
            rules,
            final_outbound,
            needs_urltest,
        }
    }
}

#[cfg(test)]
mod tests {
    use sboxpipe_types::Protocol;

    use super::*;

    #[test]
    fn default_router_emits_hijack_rule_and_auto_final() {
        let servers = vec![ParsedServer::new(Protocol::Vless, "h", 443)];
        let routing = DefaultRouter.build(&servers, &[], None, PipelineMode::Tolerant);

        assert_eq!(routing.final_outbound, URLTEST_TAG);
        assert!(routing.needs_urltest);
        assert_eq!(routing.rules.len(), 1);
        assert_eq!(routing.rules[0].target, RouteTarget::HijackDns);
    }

    #[test]
    fn final_override_wins() {
        let routing = DefaultRouter.build(&[], &[], Some("direct"), PipelineMode::Strict);
        assert_eq!(routing.final_outbound, "direct");
        assert!(!routing.needs_urltest);
    }

    #[test]
    fn user_routes_keep_declaration_order() {
        let user_routes = vec![
            RouteRuleSpec {
                domain_suffix: vec!["example.com".to_string()],
                outbound: "direct".to_string(),
                ..RouteRuleSpec::default()
            },
            RouteRuleSpec {
                ip_cidr: vec!["10.0.0.0/8".to_string()],
                outbound: "block".to_string(),
                ..RouteRuleSpec::default()
            },
        ];
        let routing = DefaultRouter.build(&[], &user_routes, None, PipelineMode::Tolerant);

        assert_eq!(routing.rules.len(), 3);
        assert_eq!(
            routing.rules[1].target,
            RouteTarget::Outbound("direct".to_string())
        );
        assert_eq!(
            routing.rules[2].target,
            RouteTarget::Outbound("block".to_string())
        );
    }
}

//! Rewriting of container environment variables that point at in-cluster services.
//!
//! Two shapes are handled: DNS references (`<svc>.<ns>.svc[...]`) and the docker-link style
//! `<SVC>_SERVICE_HOST` / `<SVC>_SERVICE_PORT` pairs.

use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec};
use once_cell::sync::Lazy;
use peerlink_core::{ResourceKind, Side};
use peerlink_store::DualCache;
use regex::{Captures, Regex};
use tracing::debug;

static DNS_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([a-z0-9](?:[-a-z0-9]*[a-z0-9])?)\.([a-z0-9](?:[-a-z0-9]*[a-z0-9])?)\.svc\b").unwrap());

/// A Service is known when either its home original or its foreign reflection is cached.
fn service_known(cache: &DualCache, name: &str, home_ns: &str, foreign_ns: &str) -> bool {
    cache.get_by_side(Side::Home, ResourceKind::Service, home_ns, name).is_ok()
        || cache.get_by_side(Side::Foreign, ResourceKind::Service, foreign_ns, name).is_ok()
}

/// Rewrite `<svc>.<home_ns>.svc` to `<svc>.<foreign_ns>.svc` for cached services.
pub fn rewrite_dns(value: &str, home_ns: &str, foreign_ns: &str, cache: &DualCache) -> String {
    DNS_REF.replace_all(value, |caps: &Captures| {
        let (svc, ns) = (&caps[1], &caps[2]);
        if ns == home_ns && service_known(cache, svc, home_ns, foreign_ns) {
            format!("{svc}.{foreign_ns}.svc")
        } else {
            caps[0].to_string()
        }
    })
    .into_owned()
}

/// Service name encoded in a `<SVC>_SERVICE_HOST` / `<SVC>_SERVICE_PORT` variable name.
fn link_target(var: &str) -> Option<(String, bool)> {
    let (prefix, is_host) = if let Some(p) = var.strip_suffix("_SERVICE_HOST") {
        (p, true)
    } else {
        (var.strip_suffix("_SERVICE_PORT")?, false)
    };
    if prefix.is_empty() {
        return None;
    }
    Some((prefix.to_ascii_lowercase().replace('_', "-"), is_host))
}

fn rewrite_link(var: &EnvVar, foreign_ns: &str, cache: &DualCache) -> Option<String> {
    let (svc, is_host) = link_target(&var.name)?;
    let foreign = cache.get_by_side(Side::Foreign, ResourceKind::Service, foreign_ns, &svc).ok()?;
    let spec = foreign.as_service()?.spec.as_ref()?;
    if is_host {
        spec.cluster_ip.clone().filter(|ip| !ip.is_empty() && ip != "None")
    } else {
        spec.ports.as_ref()?.first().map(|p| p.port.to_string())
    }
}

/// Translated copy of `env`. Variables sourced through `valueFrom` are left alone.
pub fn translate_env(env: &[EnvVar], home_ns: &str, foreign_ns: &str, cache: &DualCache) -> Vec<EnvVar> {
    env.iter()
        .map(|var| {
            let Some(value) = var.value.as_deref() else {
                return var.clone();
            };
            let rewritten = rewrite_link(var, foreign_ns, cache).unwrap_or_else(|| rewrite_dns(value, home_ns, foreign_ns, cache));
            if rewritten != value {
                debug!(var = %var.name, from = %value, to = %rewritten, "env rewritten");
            }
            EnvVar { value: Some(rewritten), ..var.clone() }
        })
        .collect()
}

fn translate_container(c: &mut Container, home_ns: &str, foreign_ns: &str, cache: &DualCache) {
    if let Some(env) = c.env.as_deref() {
        c.env = Some(translate_env(env, home_ns, foreign_ns, cache));
    }
}

/// Apply env translation to every container of a freshly forged spec.
pub fn rewrite_pod_spec(spec: &mut PodSpec, home_ns: &str, foreign_ns: &str, cache: &DualCache) {
    for c in spec.containers.iter_mut().chain(spec.init_containers.iter_mut().flatten()) {
        translate_container(c, home_ns, foreign_ns, cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
    use peerlink_core::TrackedObject;

    fn svc(ns: &str, name: &str, ip: &str, port: i32) -> TrackedObject {
        let mut s = Service::default();
        s.metadata.namespace = Some(ns.into());
        s.metadata.name = Some(name.into());
        s.metadata.resource_version = Some("1".into());
        s.spec = Some(ServiceSpec {
            cluster_ip: Some(ip.into()),
            ports: Some(vec![ServicePort { port, ..Default::default() }]),
            ..Default::default()
        });
        TrackedObject::Service(s)
    }

    fn var(name: &str, value: &str) -> EnvVar {
        EnvVar { name: name.into(), value: Some(value.into()), value_from: None }
    }

    #[test]
    fn dns_rewrite_only_for_known_services_in_home_namespace() {
        let cache = DualCache::new();
        cache.apply(Side::Home, svc("web", "db", "10.0.0.5", 5432));
        assert_eq!(rewrite_dns("db.web.svc", "web", "web-abc", &cache), "db.web-abc.svc");
        assert_eq!(rewrite_dns("postgres://db.web.svc.cluster.local:5432", "web", "web-abc", &cache), "postgres://db.web-abc.svc.cluster.local:5432");
        assert_eq!(rewrite_dns("cache.web.svc", "web", "web-abc", &cache), "cache.web.svc");
        assert_eq!(rewrite_dns("db.other.svc", "web", "web-abc", &cache), "db.other.svc");
        assert_eq!(rewrite_dns("plain value", "web", "web-abc", &cache), "plain value");
    }

    #[test]
    fn dns_pattern_captures_service_and_namespace() {
        let caps = DNS_REF.captures("http://my-db.team-a.svc:80").unwrap();
        assert_eq!((&caps[1], &caps[2]), ("my-db", "team-a"));
        assert!(DNS_REF.captures("my-db.team-a.svcx").is_none());
        assert!(DNS_REF.captures("-db.team-.svc").is_none());
    }

    #[test]
    fn service_link_vars_follow_foreign_service() {
        let cache = DualCache::new();
        cache.apply(Side::Foreign, svc("web-abc", "my-db", "10.9.0.7", 6543));
        let out = translate_env(
            &[var("MY_DB_SERVICE_HOST", "10.0.0.5"), var("MY_DB_SERVICE_PORT", "5432"), var("OTHER_SERVICE_HOST", "1.2.3.4")],
            "web",
            "web-abc",
            &cache,
        );
        let values: Vec<_> = out.iter().map(|v| v.value.as_deref().unwrap_or_default()).collect();
        assert_eq!(values, vec!["10.9.0.7", "6543", "1.2.3.4"]);
    }

    #[test]
    fn value_from_is_untouched() {
        let cache = DualCache::new();
        let v = EnvVar { name: "X".into(), value: None, value_from: Some(Default::default()) };
        assert_eq!(translate_env(&[v.clone()], "a", "b", &cache), vec![v]);
    }
}

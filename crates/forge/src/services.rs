use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use peerlink_core::labels::REFLECTION_KEY;

/// Foreign Service for `home`, or `None` when a counterpart already exists: services are
/// created once and never updated, so foreign-side edits are left alone.
pub fn translate_service(home: &Service, existing: Option<&Service>, foreign_ns: &str, home_cluster_id: &str) -> Option<Service> {
    if existing.is_some() {
        return None;
    }
    let spec = home.spec.as_ref();
    let mut labels = home.metadata.labels.clone().unwrap_or_default();
    labels.insert(REFLECTION_KEY.to_string(), home_cluster_id.to_string());
    Some(Service {
        metadata: ObjectMeta {
            name: home.metadata.name.clone(),
            namespace: Some(foreign_ns.to_string()),
            labels: Some(labels),
            annotations: None,
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: spec.and_then(|s| s.ports.as_ref()).map(|ps| ps.iter().map(foreign_port).collect()),
            selector: spec.and_then(|s| s.selector.clone()),
            type_: spec.and_then(|s| s.type_.clone()),
            ..Default::default()
        }),
        status: None,
    })
}

/// Node ports are allocated per cluster and cannot be carried over.
fn foreign_port(p: &ServicePort) -> ServicePort {
    ServicePort { node_port: None, ..p.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn home() -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("db".into()),
                namespace: Some("web".into()),
                labels: Some([("app".to_string(), "db".to_string())].into()),
                annotations: Some(BTreeMap::from([("cloud.example/lb".to_string(), "internal".to_string())])),
                uid: Some("u".into()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.0.0.5".into()),
                ports: Some(vec![ServicePort { port: 5432, node_port: Some(30432), name: Some("pg".into()), ..Default::default() }]),
                selector: Some([("app".to_string(), "db".to_string())].into()),
                type_: Some("NodePort".into()),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn copies_ports_selector_type_and_drops_annotations() {
        let out = translate_service(&home(), None, "web-abc", "home-1").unwrap();
        assert_eq!(out.metadata.namespace.as_deref(), Some("web-abc"));
        assert!(out.metadata.annotations.is_none());
        assert!(out.metadata.uid.is_none());
        assert_eq!(out.metadata.labels.as_ref().unwrap().get(REFLECTION_KEY).map(String::as_str), Some("home-1"));
        let spec = out.spec.unwrap();
        assert!(spec.cluster_ip.is_none());
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        let port = &spec.ports.unwrap()[0];
        assert_eq!((port.port, port.node_port), (5432, None));
        assert_eq!(spec.selector.unwrap().get("app").map(String::as_str), Some("db"));
    }

    #[test]
    fn existing_counterpart_is_a_no_op() {
        let existing = Service::default();
        assert!(translate_service(&home(), Some(&existing), "web-abc", "home-1").is_none());
    }
}

//! End-to-end cluster creation against a mocked broker and scripted SSH.

mod common;

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{
    mount_broker_basics, vm_json, FakeExecutor, RecordingEc2, ADMIN_KUBECONFIG,
};
use mcks::broker::BrokerClient;
use mcks::config::Config;
use mcks::error::Error;
use mcks::model::{ClusterPhase, KubernetesConfig, NetworkCni, ServiceType};
use mcks::service::{ClusterReq, ClusterService, NodeSpec};
use mcks::store::{MemStore, Store};

fn cluster_req(name: &str, cni: NetworkCni, workers: u32) -> ClusterReq {
    ClusterReq {
        name: name.to_string(),
        version: "1.23.13".to_string(),
        service_type: ServiceType::Multi,
        network_cni: cni,
        kubernetes: KubernetesConfig {
            pod_cidr: "10.244.0.0/16".to_string(),
            service_cidr: "10.96.0.0/12".to_string(),
            service_dns_domain: "cluster.local".to_string(),
            cloud_config: vec![],
        },
        control_plane: vec![NodeSpec {
            connection: "aws-conn".to_string(),
            count: 1,
            spec: "t3.medium".to_string(),
            root_disk_type: String::new(),
            root_disk_size: String::new(),
        }],
        worker: vec![NodeSpec {
            connection: "aws-conn".to_string(),
            count: workers,
            spec: "t3.medium".to_string(),
            root_disk_type: String::new(),
            root_disk_size: String::new(),
        }],
    }
}

struct Harness {
    server: MockServer,
    store: Arc<MemStore>,
    exec: Arc<FakeExecutor>,
    ec2: Arc<RecordingEc2>,
    service: ClusterService,
}

async fn harness() -> Harness {
    let server = MockServer::start().await;
    mount_broker_basics(&server, "acc1", "aws-conn", "aws").await;

    let store = Arc::new(MemStore::new());
    let exec = Arc::new(FakeExecutor::new());
    let ec2 = Arc::new(RecordingEc2::default());
    let broker = Arc::new(BrokerClient::new(server.uri()).unwrap());
    let service = ClusterService::new(
        Arc::clone(&store) as Arc<dyn Store>,
        broker,
        Arc::clone(&exec) as _,
        Arc::clone(&ec2) as _,
        Config::default(),
    );
    Harness {
        server,
        store,
        exec,
        ec2,
        service,
    }
}

async fn mount_create_mcis(server: &MockServer, name: &str, vm_names: &[&str]) {
    let vms: Vec<_> = vm_names
        .iter()
        .enumerate()
        .map(|(i, n)| vm_json(n, &format!("203.0.113.{}", i + 1), &format!("10.0.4.{}", i + 1), "aws-conn"))
        .collect();
    Mock::given(method("POST"))
        .and(path("/ns/acc1/mcis"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": name,
            "status": "Running",
            "vm": vms
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_fresh_two_node_multi_cluster_on_aws() {
    let h = harness().await;
    mount_create_mcis(&h.server, "c1", &["control-plane-1", "worker-1"]).await;

    let cluster = h
        .service
        .create_cluster("acc1", &cluster_req("c1", NetworkCni::Canal, 1))
        .await
        .unwrap();

    assert_eq!(cluster.status.phase, ClusterPhase::Provisioned);
    assert_eq!(cluster.nodes.len(), 2);
    assert_eq!(cluster.cp_leader, "control-plane-1");
    assert_eq!(cluster.kubeconfig, ADMIN_KUBECONFIG);
    assert!(cluster.nodes.iter().all(|n| n.created_time.is_some()));

    // the persisted record agrees
    let stored = h.store.get("acc1", "c1").await.unwrap().unwrap();
    assert_eq!(stored.status.phase, ClusterPhase::Provisioned);
    assert_eq!(stored.nodes.len(), 2);

    // canal is a single manifest
    let applies = h.exec.commands_containing("kubectl apply -f");
    assert_eq!(applies.len(), 3); // canal + aws ccm role-sa + daemonset
    assert!(applies.iter().any(|(_, c)| c.contains("canal.yaml")));

    // four labels per machine
    let labels = h.exec.commands_containing("label nodes");
    assert_eq!(labels.len(), 8);
    assert!(labels
        .iter()
        .any(|(_, c)| c.contains("topology.mcks.io/cluster=c1")));

    // MULTI mode on AWS: no metadata lookups, no openstack traffic
    assert!(h.exec.commands_containing("169.254.169.254").is_empty());
    // ... and no EC2 CCM preparation either
    assert!(h.ec2.associated().is_empty());
}

#[tokio::test]
async fn test_kilo_cluster_gets_mesh_annotations() {
    let h = harness().await;
    mount_create_mcis(&h.server, "kilo1", &["control-plane-1", "worker-1", "worker-2"]).await;

    let cluster = h
        .service
        .create_cluster("acc1", &cluster_req("kilo1", NetworkCni::Kilo, 2))
        .await
        .unwrap();
    assert_eq!(cluster.status.phase, ClusterPhase::Provisioned);

    // kilo applies three manifests
    let applies = h.exec.commands_containing("kubectl apply -f");
    for file in ["kilo-flannel.yaml", "kilo-crds.yaml", "kilo-kubeadm.yaml"] {
        assert!(applies.iter().any(|(_, c)| c.contains(file)), "{file} missing");
    }

    // every machine forms part of the wireguard full mesh
    for name in ["control-plane-1", "worker-1", "worker-2"] {
        let location = h
            .exec
            .commands_containing(&format!("kilo.squat.ai/location={name}"));
        assert_eq!(location.len(), 1, "location annotation for {name}");
    }
    let keepalive = h
        .exec
        .commands_containing("kilo.squat.ai/persistent-keepalive=25");
    assert_eq!(keepalive.len(), 3);
}

#[tokio::test]
async fn test_control_plane_init_failure_parks_cluster_failed() {
    let h = harness().await;
    mount_create_mcis(&h.server, "c2", &["control-plane-1", "worker-1"]).await;
    Mock::given(method("DELETE"))
        .and(path("/ns/acc1/mcis/c2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&h.server)
        .await;

    // kubeadm init never reports success
    h.exec.respond("k8s-init.sh", "error execution phase preflight");

    let err = h
        .service
        .create_cluster("acc1", &cluster_req("c2", NetworkCni::Canal, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ControlPlaneInit(_)));

    let stored = h.store.get("acc1", "c2").await.unwrap().unwrap();
    assert_eq!(stored.status.phase, ClusterPhase::Failed);

    // the mcis backing the failed cluster was destroyed
    let deleted_mcis = h
        .server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .any(|r| r.method.to_string() == "DELETE" && r.url.path() == "/ns/acc1/mcis/c2");
    assert!(deleted_mcis);
}

#[tokio::test]
async fn test_create_requires_a_control_plane() {
    let h = harness().await;
    let mut req = cluster_req("c3", NetworkCni::Canal, 1);
    req.control_plane.clear();

    let err = h.service.create_cluster("acc1", &req).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    // nothing was created or persisted
    assert!(h.store.get("acc1", "c3").await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_cluster_rejected() {
    let h = harness().await;
    mount_create_mcis(&h.server, "dup", &["control-plane-1", "worker-1"]).await;

    h.service
        .create_cluster("acc1", &cluster_req("dup", NetworkCni::Canal, 1))
        .await
        .unwrap();
    let err = h
        .service
        .create_cluster("acc1", &cluster_req("dup", NetworkCni::Canal, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

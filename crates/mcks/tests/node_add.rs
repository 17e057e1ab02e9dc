//! Worker addition flows, including rollback.

mod common;

use std::sync::Arc;

use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{
    deleted_vms, mount_broker_basics, mount_delete_vm, mount_get_mcis, provisioned_cluster,
    vm_json, FakeExecutor, RecordingEc2,
};
use mcks::broker::BrokerClient;
use mcks::config::Config;
use mcks::error::Error;
use mcks::model::{ClusterPhase, Csp, NetworkCni, Role, ServiceType};
use mcks::service::{NodeReq, NodeService, NodeSpec};
use mcks::ssh::SshError;
use mcks::store::{MemStore, Store};

struct Harness {
    server: MockServer,
    store: Arc<MemStore>,
    exec: Arc<FakeExecutor>,
    ec2: Arc<RecordingEc2>,
    service: NodeService,
}

async fn harness() -> Harness {
    let server = MockServer::start().await;
    mount_broker_basics(&server, "acc1", "aws-conn", "aws").await;

    let store = Arc::new(MemStore::new());
    let exec = Arc::new(FakeExecutor::new());
    let ec2 = Arc::new(RecordingEc2::default());
    let broker = Arc::new(BrokerClient::new(server.uri()).unwrap());
    let service = NodeService::new(
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

fn worker_req(count: u32) -> NodeReq {
    NodeReq {
        worker: vec![NodeSpec {
            connection: "aws-conn".to_string(),
            count,
            spec: "t3.medium".to_string(),
            root_disk_type: String::new(),
            root_disk_size: String::new(),
        }],
    }
}

/// Mount VM creation answering per VM name.
async fn mount_create_vms(server: &MockServer, names: &[&str]) {
    for (i, name) in names.iter().enumerate() {
        Mock::given(method("POST"))
            .and(path("/ns/acc1/mcis/c1/vm"))
            .and(body_string_contains(format!("\"{name}\"")))
            .respond_with(ResponseTemplate::new(200).set_body_json(vm_json(
                name,
                &format!("203.0.113.{}", i + 10),
                &format!("10.0.4.{}", i + 10),
                "aws-conn",
            )))
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn test_single_mode_aws_add_node_prepares_ccm() {
    let h = harness().await;
    let mut cluster = provisioned_cluster(
        "acc1",
        "c1",
        ServiceType::Single,
        NetworkCni::Canal,
        Csp::Aws,
    );
    h.store.put(&mut cluster).await.unwrap();
    mount_get_mcis(
        &h.server,
        "acc1",
        "c1",
        vec![vm_json("control-plane-1", "203.0.113.1", "10.0.4.1", "aws-conn")],
    )
    .await;
    mount_create_vms(&h.server, &["worker-1", "worker-2"]).await;

    let nodes = h.service.add_node("acc1", "c1", &worker_req(2)).await.unwrap();

    // the roster carries the leader and both new workers, once each
    assert_eq!(nodes.len(), 3);
    for name in ["worker-1", "worker-2"] {
        let matching: Vec<_> = nodes.iter().filter(|n| n.name == name).collect();
        assert_eq!(matching.len(), 1, "{name} should appear exactly once");
        assert!(matching[0].created_time.is_some());
        assert_eq!(matching[0].role, Role::Worker);
    }

    // both instances got the worker CCM role
    assert_eq!(
        h.ec2.associated(),
        vec![
            ("i-worker-1".to_string(), "k8s-worker-role-for-ccm".to_string()),
            ("i-worker-2".to_string(), "k8s-worker-role-for-ccm".to_string()),
        ]
    );

    // instance + security group + subnet tagged as owned, per worker
    let tagged = h.ec2.tagged_resources();
    for resource in [
        "i-worker-1",
        "sg-worker-1",
        "subnet-worker-1",
        "i-worker-2",
        "sg-worker-2",
        "subnet-worker-2",
    ] {
        assert!(tagged.contains(&resource.to_string()), "{resource} not tagged");
    }
    assert!(h.ec2.tag_values().iter().all(|v| v == "owned"));

    // kubectl labels went to the csp-assigned hostnames
    assert!(!h
        .exec
        .commands_containing("label nodes ip-worker-1.internal")
        .is_empty());

    // persisted
    let stored = h.store.get("acc1", "c1").await.unwrap().unwrap();
    assert_eq!(stored.nodes.len(), 3);
}

#[tokio::test]
async fn test_bootstrap_fan_out_failure_rolls_back_all_new_vms() {
    let h = harness().await;
    let mut cluster = provisioned_cluster(
        "acc1",
        "c1",
        ServiceType::Multi,
        NetworkCni::Canal,
        Csp::Aws,
    );
    h.store.put(&mut cluster).await.unwrap();
    mount_get_mcis(
        &h.server,
        "acc1",
        "c1",
        vec![vm_json("control-plane-1", "203.0.113.1", "10.0.4.1", "aws-conn")],
    )
    .await;
    mount_create_vms(&h.server, &["worker-1", "worker-2", "worker-3"]).await;
    mount_delete_vm(&h.server, "acc1", "c1").await;

    // the middle machine never answers
    h.exec.mark_unreachable("worker-2");

    let err = h
        .service
        .add_node("acc1", "c1", &worker_req(3))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Ssh(SshError::Unreachable { .. })));

    // every created VM was destroyed again
    let mut deleted = deleted_vms(&h.server).await;
    deleted.sort();
    assert_eq!(deleted, vec!["worker-1", "worker-2", "worker-3"]);

    // complete rollback: none of the requested workers persists
    let stored = h.store.get("acc1", "c1").await.unwrap().unwrap();
    let worker_count = stored.nodes.iter().filter(|n| n.role == Role::Worker).count();
    assert_eq!(worker_count, 0);
    assert_eq!(stored.nodes.len(), 1);
}

#[tokio::test]
async fn test_empty_join_token_aborts_before_vm_creation() {
    let h = harness().await;
    let mut cluster = provisioned_cluster(
        "acc1",
        "c1",
        ServiceType::Multi,
        NetworkCni::Canal,
        Csp::Aws,
    );
    h.store.put(&mut cluster).await.unwrap();
    mount_get_mcis(
        &h.server,
        "acc1",
        "c1",
        vec![vm_json("control-plane-1", "203.0.113.1", "10.0.4.1", "aws-conn")],
    )
    .await;

    h.exec.respond("kubeadm token create", "");

    let err = h
        .service
        .add_node("acc1", "c1", &worker_req(2))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::JoinTokenEmpty));

    // no VM was ever requested
    let vm_posts = h
        .server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.to_string() == "POST" && r.url.path().contains("/vm"))
        .count();
    assert_eq!(vm_posts, 0);
}

#[tokio::test]
async fn test_single_mode_rejects_foreign_connection() {
    let h = harness().await;
    let mut cluster = provisioned_cluster(
        "acc1",
        "c1",
        ServiceType::Single,
        NetworkCni::Canal,
        Csp::Aws,
    );
    h.store.put(&mut cluster).await.unwrap();
    mount_get_mcis(
        &h.server,
        "acc1",
        "c1",
        vec![vm_json("control-plane-1", "203.0.113.1", "10.0.4.1", "aws-conn")],
    )
    .await;

    let req = NodeReq {
        worker: vec![NodeSpec {
            connection: "gcp-conn".to_string(),
            count: 1,
            spec: "n1-standard-2".to_string(),
            root_disk_type: String::new(),
            root_disk_size: String::new(),
        }],
    };
    let err = h.service.add_node("acc1", "c1", &req).await.unwrap_err();
    assert!(err
        .to_string()
        .contains("The new node must be the same connection config"));
}

#[tokio::test]
async fn test_add_node_requires_provisioned_phase() {
    let h = harness().await;
    let mut cluster = provisioned_cluster(
        "acc1",
        "c1",
        ServiceType::Multi,
        NetworkCni::Canal,
        Csp::Aws,
    );
    cluster.status.phase = ClusterPhase::Provisioning;
    h.store.put(&mut cluster).await.unwrap();

    let err = h
        .service
        .add_node("acc1", "c1", &worker_req(1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Unable to add a node"));
}

#[tokio::test]
async fn test_add_node_unknown_cluster() {
    let h = harness().await;
    let err = h
        .service
        .add_node("acc1", "ghost", &worker_req(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ClusterNotFound { .. }));
}

//! Multi-cloud Kubernetes cluster provisioning core.
//!
//! This crate assembles Kubernetes clusters from freshly created VMs
//! spread across cloud providers: it connects to the machines over SSH,
//! bootstraps and initializes Kubernetes with kubeadm, joins nodes,
//! wires the container-network and cloud-controller plug-ins, and keeps
//! a persisted cluster model in step with what is running.
//!
//! The moving parts:
//! - [`broker`] — typed client for the infrastructure broker that
//!   actually creates VMs, networks and keypairs (MCIS/MCIR)
//! - [`ssh`] — the remote executor every shell interaction goes through
//! - [`machine`] — one VM and its primitive operations
//! - [`provision`] — the orchestrator driving bootstrap, control-plane
//!   init, CNI/CCM installation, joins and labels
//! - [`service`] — the public cluster and node entry points with
//!   validation and rollback
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use mcks::broker::BrokerClient;
//! use mcks::cloud::aws::Ec2Sdk;
//! use mcks::config::Config;
//! use mcks::service::{NodeReq, NodeService, NodeSpec};
//! use mcks::ssh::SshExecutor;
//! use mcks::store::MemStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), mcks::Error> {
//!     let config = Config::load("mcks.toml")?;
//!     let service = NodeService::new(
//!         Arc::new(MemStore::new()),
//!         Arc::new(BrokerClient::new(&config.broker_url)?),
//!         Arc::new(SshExecutor::new(&config.ssh)),
//!         Arc::new(Ec2Sdk::load().await),
//!         config,
//!     );
//!
//!     let nodes = service
//!         .add_node(
//!             "acc1",
//!             "cluster-1",
//!             &NodeReq {
//!                 worker: vec![NodeSpec {
//!                     connection: "aws-conn".into(),
//!                     count: 2,
//!                     spec: "t3.medium".into(),
//!                     root_disk_type: String::new(),
//!                     root_disk_size: String::new(),
//!                 }],
//!             },
//!         )
//!         .await?;
//!     println!("{} nodes", nodes.len());
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod cloud;
pub mod config;
pub mod error;
pub mod join;
pub mod machine;
pub mod model;
pub mod provision;
pub mod remote;
pub mod service;
pub mod ssh;
pub mod store;

pub use error::{Error, Result};

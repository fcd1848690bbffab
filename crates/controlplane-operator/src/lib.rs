pub mod certificates;
pub mod config;
pub mod controlplane_controller;
pub mod crds;
pub mod error;
pub mod gateway;
pub mod kubeconfig;
pub mod lifecycle;
pub mod manifest;
pub mod pki;
pub mod workload;

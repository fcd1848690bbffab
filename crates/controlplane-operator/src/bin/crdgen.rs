use controlplane_operator::crds::controlplane::ControlPlane;
use kube::core::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&ControlPlane::crd())?);
    Ok(())
}

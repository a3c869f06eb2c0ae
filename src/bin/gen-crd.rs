use configpropagator::crd::propagation::ConfigPropagation;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    // Pipe through a JSON-to-YAML converter for a manifest:
    // cargo run --bin gen-crd | yq -P
    let crd = serde_json::to_string_pretty(&ConfigPropagation::crd())?;
    println!("{}", crd);
    Ok(())
}

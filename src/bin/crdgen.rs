use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    println!("---");
    print!(
        "{}",
        serde_yaml::to_string(&swift_operator::resources::SwiftStorage::crd())?
    );
    Ok(())
}

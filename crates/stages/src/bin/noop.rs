//! `org.osbuild.noop` — does nothing, successfully.

fn main() {
  osforge_stages::run(|client, _arguments| {
    client.log("noop: nothing to do")?;
    Ok(())
  })
}

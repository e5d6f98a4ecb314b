use super::{json_pretty, EXIT_SUCCESS};
use piengine_core::PluginRegistry;

pub fn run(json: bool) -> Result<u8, String> {
    let registry = PluginRegistry::builtin();
    let names = registry.names();
    if json {
        println!("{}", json_pretty(&names)?);
    } else {
        for name in names {
            println!("{name}");
        }
    }
    Ok(EXIT_SUCCESS)
}

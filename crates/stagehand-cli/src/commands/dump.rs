use super::{fail, json_pretty, EXIT_SUCCESS};
use stagehand_core::Engine;
use stagehand_schema::TargetSelector;

pub fn run(engine: &Engine, targets: &TargetSelector, json: bool) -> Result<u8, String> {
    let dump = engine.dump(targets).map_err(|e| fail(&e))?;
    if json {
        println!("{}", json_pretty(&dump)?);
        return Ok(EXIT_SUCCESS);
    }
    for (target, values) in &dump {
        println!("{target}:");
        if values.is_empty() {
            println!("  (no configuration)");
        }
        for (key, value) in values {
            println!("  {key} = {value}");
        }
    }
    Ok(EXIT_SUCCESS)
}

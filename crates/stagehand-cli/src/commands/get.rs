use super::{fail, json_pretty, EXIT_SUCCESS};
use stagehand_core::{CoreError, Engine};
use stagehand_schema::{KeyPath, TargetSelector};

pub fn run(
    engine: &Engine,
    keys: &[String],
    targets: &TargetSelector,
    json: bool,
) -> Result<u8, String> {
    let keys = keys
        .iter()
        .map(|k| KeyPath::parse(k).map_err(|e| fail(&CoreError::from(e))))
        .collect::<Result<Vec<_>, _>>()?;
    let values = engine.get(&keys, targets).map_err(|e| fail(&e))?;
    if json {
        println!("{}", json_pretty(&values)?);
        return Ok(EXIT_SUCCESS);
    }
    for (target, entries) in &values {
        println!("{target}:");
        for (key, value) in entries {
            match value {
                Some(v) => println!("  {key} = {v}"),
                None => println!("  {key} (unset)"),
            }
        }
    }
    Ok(EXIT_SUCCESS)
}

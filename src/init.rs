use anyhow::Result;
use dialoguer::Confirm;
use std::path::Path;

use crate::config::{CONFIG_FILE_NAME, TEMPLATE};

pub fn handle_init(app_root: &Path, force: bool) -> Result<()> {
    let path = app_root.join(CONFIG_FILE_NAME);

    if path.exists() && !force {
        let overwrite = Confirm::new()
            .with_prompt(format!("{} already exists. Overwrite?", path.display()))
            .default(false)
            .interact()?;

        if !overwrite {
            println!("Aborted.");
            return Ok(());
        }
    }

    std::fs::create_dir_all(app_root)?;
    std::fs::write(&path, TEMPLATE)?;
    println!("✓ Created {}", path.display());

    Ok(())
}

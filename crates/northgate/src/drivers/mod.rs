// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Built-in drivers.
//!
//! | Type | Side | Purpose |
//! |------|------|---------|
//! | `simulated` | South | deterministic sine signals, history capable |
//! | `console` | North | prints deliveries |
//! | `folder` | North | writes deliveries into a folder |
//!
//! The [`memory`] drivers are not registered; embedders and tests wire them
//! through [`DriverRegistry::register_north`] / [`DriverRegistry::register_south`].

pub mod console;
pub mod folder;
pub mod memory;
pub mod simulated;

use crate::driver::{DriverRegistry, NorthDriver, SouthDriver};
use std::sync::Arc;

/// Register the built-in drivers.
pub fn register_builtins(registry: &mut DriverRegistry) {
    registry.register_south("simulated", |ctx| {
        let driver = simulated::SimulatedSouth::new(ctx.info, &ctx.settings, ctx.emitter)?;
        Ok(Arc::new(driver) as Arc<dyn SouthDriver>)
    });
    registry.register_north("console", |ctx| {
        let driver = console::ConsoleNorth::new(ctx.info, &ctx.settings)?;
        Ok(Arc::new(driver) as Arc<dyn NorthDriver>)
    });
    registry.register_north("folder", |ctx| {
        let driver = folder::FolderNorth::new(ctx.info, &ctx.settings)?;
        Ok(Arc::new(driver) as Arc<dyn NorthDriver>)
    });
}

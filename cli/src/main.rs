// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator command for bootstrapping and tearing down management clusters.

use anyhow::Result;
use clap::Parser;

mod admin;
mod config;
mod dispatch;
mod installer;

use dispatch::FlotillaApp;

#[tokio::main]
async fn main() -> Result<()> {
    let app = FlotillaApp::parse();
    let log = FlotillaApp::setup_log(app.log_file.as_deref(), app.verbose)?;
    app.exec(&log).await
}

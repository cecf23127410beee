//! Materialises a text object to disk.
//!
//! The renderer writes the current contents of a named text object when
//! it starts and again when it stops, and optionally on a periodic
//! flush. Writes go to a sibling temporary file followed by a rename, so
//! readers never observe a torn file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use concord_types::component::{Component, Lifecycle};
use concord_types::doc::SharedDoc;

use crate::prelude::*;

pub struct TextRenderer {
	lifecycle: Lifecycle,
	doc: SharedDoc,
	text_name: String,
	path: PathBuf,
	render: bool,
	flush_interval: Option<Duration>,
}

impl TextRenderer {
	pub fn new(
		doc: SharedDoc,
		text_name: impl Into<String>,
		path: impl Into<PathBuf>,
		render: bool,
	) -> Arc<Self> {
		Arc::new(Self {
			lifecycle: Lifecycle::new(),
			doc,
			text_name: text_name.into(),
			path: path.into(),
			render,
			flush_interval: None,
		})
	}

	/// Additionally flush every `interval` while running.
	pub fn with_flush_interval(
		doc: SharedDoc,
		text_name: impl Into<String>,
		path: impl Into<PathBuf>,
		interval: Duration,
	) -> Arc<Self> {
		Arc::new(Self {
			lifecycle: Lifecycle::new(),
			doc,
			text_name: text_name.into(),
			path: path.into(),
			render: true,
			flush_interval: Some(interval),
		})
	}

	/// Write the current text contents to the output path.
	pub async fn write(&self) -> CnResult<()> {
		let content = self.doc.text_content(&self.text_name)?;
		let mut tmp = self.path.as_os_str().to_owned();
		tmp.push(".tmp");
		let tmp = PathBuf::from(tmp);
		tokio::fs::write(&tmp, content.as_bytes()).await?;
		tokio::fs::rename(&tmp, &self.path).await?;
		info!(path = %self.path.display(), "wrote rendered text");
		Ok(())
	}
}

#[async_trait]
impl Component for TextRenderer {
	fn label(&self) -> &'static str {
		"renderer"
	}

	fn lifecycle(&self) -> &Lifecycle {
		&self.lifecycle
	}

	async fn run(&self) -> CnResult<()> {
		if self.render {
			self.write().await?;
		}
		match self.flush_interval {
			Some(interval) if self.render => {
				let mut timer = tokio::time::interval(interval);
				timer.tick().await;
				loop {
					timer.tick().await;
					if let Err(err) = self.write().await {
						warn!(error = %err, "periodic flush failed");
					}
				}
			}
			_ => {
				self.lifecycle.cancelled().await;
				Ok(())
			}
		}
	}

	async fn cleanup(&self) -> CnResult<()> {
		if self.render {
			self.write().await?;
			info!(path = %self.path.display(), "saved and closed file");
		}
		Ok(())
	}
}


// vim: ts=4

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use super::TypeView;
use crate::Error;

#[derive(Debug, Default)]
pub struct RefresherReport {
	pub refreshed: Vec<String>,
	/// Fresh enough, or holding changes the remote vault doesn't know about yet
	pub skipped: Vec<String>,
	pub failed: Vec<(String, Error)>,
}

/// Refreshes several views of a record together, leaving fresh ones alone.
pub struct TypeViewRefresher {
	views: Vec<Arc<TypeView>>,
	max_age: chrono::Duration,
}

impl TypeViewRefresher {
	#[must_use]
	pub fn new(views: Vec<Arc<TypeView>>, max_age: chrono::Duration) -> Self {
		Self { views, max_age }
	}

	#[must_use]
	pub fn views(&self) -> &[Arc<TypeView>] {
		&self.views
	}

	pub async fn refresh(&self) -> RefresherReport {
		let mut report = RefresherReport::default();

		let (stale, fresh): (Vec<_>, Vec<_>) =
			self.views.iter().partition(|view| view.is_stale(self.max_age));

		report
			.skipped
			.extend(fresh.into_iter().map(|view| view.name().to_string()));

		let results = join_all(stale.iter().map(|view| view.refresh())).await;

		for (view, res) in stale.into_iter().zip(results) {
			let name = view.name().to_string();
			match res {
				Ok(Some(_)) => report.refreshed.push(name),
				Ok(None) => report.skipped.push(name),
				Err(e) => {
					warn!(view = %name, ?e, "Failed to refresh view");
					report.failed.push((name, e));
				}
			}
		}

		debug!(
			refreshed = report.refreshed.len(),
			skipped = report.skipped.len(),
			failed = report.failed.len(),
			"Refreshed views"
		);

		report
	}
}

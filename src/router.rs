//! Decides which caching strategy, if any, handles an intercepted request.

use color_eyre::Result;
use regex::Regex;
use reqwest::Method;

use crate::cache::Partition;
use crate::config::RoutingConfig;
use crate::http::Request;

/// Request classes, checked in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
  /// Matches an exclusion pattern; never intercepted
  Excluded,
  Api,
  HtmlNavigation,
  StaticAsset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
}

/// What the worker does with an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
  /// Leave the request to the default network behavior
  Passthrough,
  Respond {
    strategy: Strategy,
    partition: Partition,
  },
}

pub struct Router {
  exclude: Vec<Regex>,
  api_segment: String,
}

impl Router {
  pub fn new(config: &RoutingConfig) -> Result<Self> {
    Ok(Self {
      exclude: config.exclude_patterns()?,
      api_segment: config.api_segment.clone(),
    })
  }

  pub fn classify(&self, request: &Request) -> RouteKind {
    let href = request.url.as_str();
    if self.exclude.iter().any(|pattern| pattern.is_match(href)) {
      return RouteKind::Excluded;
    }

    if request.url.path().contains(&self.api_segment) {
      return RouteKind::Api;
    }

    if request.accepts_html() {
      return RouteKind::HtmlNavigation;
    }

    RouteKind::StaticAsset
  }

  pub fn route(&self, request: &Request) -> Dispatch {
    let kind = self.classify(request);

    // Only GET responses are ever cached
    if kind == RouteKind::Excluded || request.method != Method::GET {
      return Dispatch::Passthrough;
    }

    match kind {
      RouteKind::Excluded => Dispatch::Passthrough,
      RouteKind::Api => Dispatch::Respond {
        strategy: Strategy::NetworkFirst,
        partition: Partition::Data,
      },
      RouteKind::HtmlNavigation => Dispatch::Respond {
        strategy: Strategy::NetworkFirst,
        partition: Partition::Dynamic,
      },
      RouteKind::StaticAsset => Dispatch::Respond {
        strategy: Strategy::CacheFirst,
        partition: Partition::Static,
      },
    }
  }
}

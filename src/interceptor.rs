// Copyright 2024 the framewire authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A linear responsibility chain.
//!
//! Every inbound request traverses `[head?, body..., tail]` where the tail
//! is the terminal dispatcher. Each stage either transforms the carried
//! request and proceeds, or swallows it to terminate the chain. A chain
//! object is built per request and never reused.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::message::Message;
use crate::request::Request;

/// Data attached to a request by a decoder stage, consumed by handlers.
pub type IcData = Box<dyn Any + Send + Sync>;

/// One stage of the chain.
///
/// `intercept` receives the chain cursor positioned after itself. Returning
/// `Some(request)` hands the (possibly transformed) request back to the
/// caller once the remaining stages ran; returning `None` means a stage
/// consumed the request (the terminal dispatcher always does).
#[async_trait]
pub trait Interceptor: Send + Sync {
  async fn intercept(&self, chain: Chain) -> Option<Request>;
}

/// An immutable cursor over the stage list plus the carried request.
pub struct Chain {
  stages: Arc<[Arc<dyn Interceptor>]>,
  position: usize,
  request: Request,
}

impl Chain {
  pub(crate) fn new(
    stages: Arc<[Arc<dyn Interceptor>]>,
    request: Request,
  ) -> Self {
    Self {
      stages,
      position: 0,
      request,
    }
  }

  pub fn request(&self) -> &Request {
    &self.request
  }

  pub fn request_mut(&mut self) -> &mut Request {
    &mut self.request
  }

  pub fn into_request(self) -> Request {
    self.request
  }

  /// Invokes the next stage. Proceeding past the end returns the carried
  /// request unchanged.
  pub async fn proceed(mut self) -> Option<Request> {
    if self.position < self.stages.len() {
      let stage = self.stages[self.position].clone();
      self.position += 1;
      stage.intercept(self).await
    } else {
      Some(self.request)
    }
  }

  /// Replaces the carried request, then proceeds.
  pub async fn proceed_with(mut self, request: Request) -> Option<Request> {
    self.request = request;
    self.proceed().await
  }

  /// Rewrites the carried request's message and attached decode result,
  /// then proceeds. Used by decoder stages once a frame is parsed.
  pub async fn proceed_with_message(
    mut self,
    message: Message,
    decoded: Option<IcData>,
  ) -> Option<Request> {
    self.request.set_message(message);
    if let Some(decoded) = decoded {
      self.request.set_response(decoded);
    }
    self.proceed().await
  }
}

/// Assembles the stage list for the dispatcher.
#[derive(Default)]
pub struct ChainBuilder {
  head: Option<Arc<dyn Interceptor>>,
  body: Vec<Arc<dyn Interceptor>>,
  tail: Option<Arc<dyn Interceptor>>,
}

impl ChainBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_head(&mut self, stage: Arc<dyn Interceptor>) {
    self.head = Some(stage);
  }

  pub fn add(&mut self, stage: Arc<dyn Interceptor>) {
    self.body.push(stage);
  }

  pub fn set_tail(&mut self, stage: Arc<dyn Interceptor>) {
    self.tail = Some(stage);
  }

  /// Snapshot of `[head?, body..., tail?]` with an optional extra terminal
  /// stage appended, for callers that own the dispatcher.
  pub(crate) fn assemble(
    &self,
    terminal: Option<Arc<dyn Interceptor>>,
  ) -> Arc<[Arc<dyn Interceptor>]> {
    let mut stages: Vec<Arc<dyn Interceptor>> = Vec::with_capacity(
      self.body.len() + 3,
    );
    if let Some(head) = &self.head {
      stages.push(head.clone());
    }
    stages.extend(self.body.iter().cloned());
    if let Some(tail) = &self.tail {
      stages.push(tail.clone());
    }
    if let Some(terminal) = terminal {
      stages.push(terminal);
    }
    stages.into()
  }

  /// Runs `request` through all registered stages.
  pub async fn execute(&self, request: Request) -> Option<Request> {
    Chain::new(self.assemble(None), request).proceed().await
  }
}

// Copyright Polaris Sidecar Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::registry::{
    CallResult, Discovery, Error, Instance, Limiter, QuotaRequest, QuotaResponse, ServiceKey,
};

/// In-memory [Discovery] returning canned data and counting interactions.
#[derive(Default)]
pub struct StubDiscovery {
    instances: Vec<Instance>,
    services: Vec<ServiceKey>,
    lookups: AtomicUsize,
    reports: Mutex<Vec<CallResult>>,
}

impl StubDiscovery {
    pub fn with_instances(instances: Vec<Instance>) -> Self {
        Self {
            instances,
            ..Default::default()
        }
    }

    pub fn with_services(services: Vec<ServiceKey>) -> Self {
        Self {
            services,
            ..Default::default()
        }
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn reported(&self) -> Vec<CallResult> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl Discovery for StubDiscovery {
    async fn get_one_instance(
        &self,
        _service: &ServiceKey,
        _source_labels: &HashMap<String, String>,
    ) -> Result<Vec<Instance>, Error> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.instances.clone())
    }

    async fn list_services(&self, _namespace: &str) -> Result<Vec<ServiceKey>, Error> {
        Ok(self.services.clone())
    }

    async fn report_call(&self, result: CallResult) -> Result<(), Error> {
        self.reports.lock().unwrap().push(result);
        Ok(())
    }
}

/// In-memory [Limiter] answering with a fixed response and remembering the
/// last quota request.
pub struct StubLimiter {
    response: QuotaResponse,
    last: Mutex<Option<QuotaRequest>>,
}

impl StubLimiter {
    pub fn new(response: QuotaResponse) -> Self {
        Self {
            response,
            last: Mutex::new(None),
        }
    }

    pub fn last_request(&self) -> Option<QuotaRequest> {
        self.last.lock().unwrap().clone()
    }
}

#[async_trait]
impl Limiter for StubLimiter {
    async fn acquire_quota(&self, request: &QuotaRequest) -> Result<QuotaResponse, Error> {
        *self.last.lock().unwrap() = Some(request.clone());
        Ok(self.response.clone())
    }
}

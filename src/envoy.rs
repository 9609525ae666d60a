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

//! Generated Envoy API types (rate limit service, secret discovery service).

pub mod service {
    pub mod ratelimit {
        pub mod v3 {
            tonic::include_proto!("envoy.service.ratelimit.v3");
        }
    }
    pub mod discovery {
        pub mod v3 {
            tonic::include_proto!("envoy.service.discovery.v3");
        }
    }
    pub mod secret {
        pub mod v3 {
            tonic::include_proto!("envoy.service.secret.v3");
        }
    }
}

pub mod extensions {
    pub mod transport_sockets {
        pub mod tls {
            pub mod v3 {
                tonic::include_proto!("envoy.extensions.transport_sockets.tls.v3");
            }
        }
    }
}

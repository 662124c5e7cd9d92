// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod authentication;
pub mod clients;
pub mod identity;
pub mod protocol;

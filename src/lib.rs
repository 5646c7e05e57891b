pub mod compile;
pub mod config;
pub mod convert;
pub mod crawler;
pub mod dag;
pub mod datafile;
pub mod domain;
pub mod download;
pub mod error;
pub mod frame;
pub mod fs_util;
pub mod metadata;
pub mod orchestrator;
pub mod policy;
pub mod processing;
pub mod remap;
pub mod script;
pub mod writer;

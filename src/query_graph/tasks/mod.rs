pub(crate) mod column_mapper;
pub(crate) mod decomposition;
pub(crate) mod executor;
pub(crate) mod followups;
pub(crate) mod narrative;
pub(crate) mod refinement;
pub(crate) mod spec_builder;
pub(crate) mod sql_synthesizer;
pub(crate) mod summarizer;
pub(crate) mod table_resolution;
pub(crate) mod validator;

mod pipeline_e2e;

mod tests_lineage;

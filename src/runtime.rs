/// Module loader runtime embedded in entry chunks by the registry generator.
///
/// The loader keeps a registry keyed by module path:
/// - `register(path, factory, deps, asyncDeps)` records a module without running it
/// - `require(fromPath, request)` runs a module once, memoizes its exports and
///   records `fromPath` in the module's `parents` set
/// - `importAsync(fromPath, request)` loads the chunk holding the target (and the
///   chunks it imports) and resolves once those chunks have self-registered
/// - `applyUpdate({ type: 'update', filePath, contents })` swaps one module and
///   re-runs it together with every module that transitively required it
pub fn module_loader_source() -> &'static str {
    MODULE_LOADER
}

const MODULE_LOADER: &str = r#"
// kiln module loader runtime
(function (global) {
    'use strict';
    if (global.__kiln) {
        return;
    }

    var definitions = Object.create(null);
    var modules = Object.create(null);
    var manifest = Object.create(null);
    var loadedChunks = Object.create(null);
    var pendingChunks = Object.create(null);

    function register(path, factory, deps, asyncDeps) {
        definitions[path] = { factory: factory, deps: deps || {}, asyncDeps: asyncDeps || {} };
    }

    function resolve(fromPath, request) {
        var definition = fromPath === null ? null : definitions[fromPath];
        if (definition && Object.prototype.hasOwnProperty.call(definition.deps, request)) {
            return definition.deps[request];
        }
        return request;
    }

    function require(fromPath, request) {
        var path = resolve(fromPath, request);
        var module = modules[path];
        if (module) {
            if (fromPath !== null) {
                module.parents.add(fromPath);
            }
            return module.exports;
        }

        var definition = definitions[path];
        if (!definition) {
            throw new Error('[kiln] module is not registered: ' + path);
        }

        module = { path: path, exports: {}, parents: new Set() };
        if (fromPath !== null) {
            module.parents.add(fromPath);
        }
        modules[path] = module;

        definition.factory.call(
            module.exports,
            function (dep) { return require(path, dep); },
            module,
            module.exports,
            function (dep) { return importAsync(path, dep); }
        );
        return module.exports;
    }

    function setManifest(entries) {
        Object.keys(entries).forEach(function (id) {
            manifest[id] = entries[id];
        });
    }

    function chunkLoaded(id) {
        loadedChunks[id] = true;
        var waiters = pendingChunks[id] || [];
        delete pendingChunks[id];
        waiters.forEach(function (waiter) { waiter.resolve(); });
    }

    function loadChunk(id) {
        if (loadedChunks[id]) {
            return Promise.resolve();
        }
        var info = manifest[id];
        if (!info) {
            return Promise.reject(new Error('[kiln] unknown chunk: ' + id));
        }

        return loadChunks(info.imports || []).then(function () {
            if (loadedChunks[id]) {
                return undefined;
            }
            return new Promise(function (resolve, reject) {
                var first = !pendingChunks[id];
                (pendingChunks[id] = pendingChunks[id] || []).push({ resolve: resolve, reject: reject });
                if (!first) {
                    return;
                }
                var script = document.createElement('script');
                script.src = info.url;
                script.async = true;
                script.onerror = function () {
                    var waiters = pendingChunks[id] || [];
                    delete pendingChunks[id];
                    waiters.forEach(function (waiter) {
                        waiter.reject(new Error('[kiln] failed to load chunk ' + id));
                    });
                };
                document.head.appendChild(script);
            });
        });
    }

    function loadChunks(ids) {
        return Promise.all(ids.map(loadChunk));
    }

    function importAsync(fromPath, request) {
        var definition = definitions[fromPath];
        var chunk = definition && definition.asyncDeps[request];
        var ready = chunk ? loadChunk(chunk) : Promise.resolve();
        return ready.then(function () { return require(fromPath, request); });
    }

    function findPath(filePath) {
        if (definitions[filePath]) {
            return filePath;
        }
        var normalized = String(filePath).replace(/\\/g, '/');
        var keys = Object.keys(definitions);
        for (var i = 0; i < keys.length; i++) {
            if (normalized === keys[i] || normalized.slice(-(keys[i].length + 1)) === '/' + keys[i]) {
                return keys[i];
            }
        }
        return null;
    }

    function applyStyle(path, contents) {
        var selector = 'style[data-kiln-path="' + path + '"]';
        var style = document.querySelector(selector);
        if (!style) {
            style = document.createElement('style');
            style.setAttribute('data-kiln-path', path);
            document.head.appendChild(style);
        }
        style.textContent = contents;
    }

    function applyUpdate(message) {
        if (!message || message.type !== 'update') {
            return false;
        }
        if (/\.css$/.test(message.filePath)) {
            applyStyle(message.filePath, message.contents);
            return true;
        }

        var path = findPath(message.filePath);
        if (path === null) {
            return false;
        }
        var definition = definitions[path];
        definition.factory = new Function('require', 'module', 'exports', 'importAsync', message.contents);

        // everything that (transitively) required the module runs again
        var affected = [path];
        var seen = new Set(affected);
        for (var i = 0; i < affected.length; i++) {
            var module = modules[affected[i]];
            if (!module) {
                continue;
            }
            module.parents.forEach(function (parent) {
                if (!seen.has(parent)) {
                    seen.add(parent);
                    affected.push(parent);
                }
            });
        }

        var roots = affected.filter(function (p) {
            return !modules[p] || modules[p].parents.size === 0;
        });
        affected.forEach(function (p) { delete modules[p]; });
        roots.forEach(function (p) { require(null, p); });
        return true;
    }

    global.__kiln = {
        register: register,
        require: require,
        importAsync: importAsync,
        manifest: setManifest,
        chunkLoaded: chunkLoaded,
        loadChunks: loadChunks,
        applyUpdate: applyUpdate,
        modules: modules
    };
})(typeof globalThis !== 'undefined' ? globalThis : this);
"#;

/// Websocket client that feeds live updates into the module loader
pub fn live_update_client_source(url: &str) -> String {
    let url = serde_json::to_string(url).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"
// kiln live update client
(function () {{
    'use strict';
    var url = {url};
    var attempts = 0;

    function connect() {{
        var socket;
        try {{
            socket = new WebSocket(url);
        }} catch (error) {{
            console.warn('[kiln] live updates unavailable:', error);
            return retry();
        }}

        socket.onopen = function () {{
            attempts = 0;
            console.log('[kiln] live updates connected');
        }};
        socket.onmessage = function (event) {{
            var message;
            try {{
                message = JSON.parse(event.data);
            }} catch (error) {{
                console.warn('[kiln] invalid update message:', error);
                return;
            }}
            switch (message.type) {{
                case 'update':
                    if (!window.__kiln.applyUpdate(message)) {{
                        window.location.reload();
                    }}
                    break;
                case 'changed':
                    console.log('[kiln] rebuilt:', message.changedPaths);
                    break;
                case 'error':
                    console.error('[kiln] build failed:', message.message);
                    break;
            }}
        }};
        socket.onclose = retry;
    }}

    function retry() {{
        if (attempts++ < 10) {{
            setTimeout(connect, 1000 * attempts);
        }}
    }}

    connect();
}})();
"#
    )
}
